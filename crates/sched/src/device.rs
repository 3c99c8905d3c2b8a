//! Contracts the scheduler expects from the device side.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use kds_core::{CopyBoCmd, Command};

use crate::error::DeviceError;
use crate::signal::WakeSignal;

/// Register map handed to a CU before it is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regmap<'a> {
    /// Consecutive 32-bit registers starting at offset 0.
    Consecutive(&'a [u32]),
    /// Explicit (offset, value) writes.
    Pairs(&'a [(u32, u32)]),
}

/// Register-level access to hardware compute units.
pub trait CuDevice: Send + Sync {
    /// CUs without interrupt support force the session into polling.
    fn supports_interrupts(&self, _cu: usize) -> bool {
        true
    }

    fn configure(&self, cu: usize, regmap: Regmap<'_>);

    fn start(&self, cu: usize);

    /// Completions since the last call.
    fn poll_done(&self, cu: usize) -> u32;

    fn reset(&self, cu: usize);

    fn reset_done(&self, cu: usize) -> bool;

    /// Begin an async buffer copy. `done` must be completed exactly once,
    /// possibly from another thread, unless an error is returned.
    fn start_copy(&self, req: &CopyBoCmd, done: CopyCompletion) -> Result<(), DeviceError>;
}

/// An on-device scheduler that tracks completion itself.
pub trait EmbeddedScheduler: Send + Sync {
    fn submit(&self, slot: usize, command: &Command) -> Result<(), DeviceError>;

    /// `Some(true)` when the slot completed, `Some(false)` when it failed.
    fn poll(&self, slot: usize) -> Option<bool>;
}

pub(crate) const COPY_PENDING: u8 = 0;
pub(crate) const COPY_DONE: u8 = 1;
pub(crate) const COPY_FAILED: u8 = 2;

/// Completion token for an async copy.
#[derive(Debug, Clone)]
pub struct CopyCompletion {
    flag: Arc<AtomicU8>,
    signal: Arc<WakeSignal>,
}

impl CopyCompletion {
    pub(crate) fn new(signal: Arc<WakeSignal>) -> Self {
        Self {
            flag: Arc::new(AtomicU8::new(COPY_PENDING)),
            signal,
        }
    }

    pub(crate) fn flag(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.flag)
    }

    pub fn complete(self, ok: bool) {
        let state = if ok { COPY_DONE } else { COPY_FAILED };
        self.flag.store(state, Ordering::Release);
        self.signal.poke();
    }
}
