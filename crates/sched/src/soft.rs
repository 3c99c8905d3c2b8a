//! Software-emulated compute units.
//!
//! Soft CUs are brought up and torn down by an external worker manager that
//! consumes [`SoftCommand`]s from the dispatcher. Each worker then registers
//! its [`SoftCu`] and blocks in [`SoftCu::wait_for_work`] until the scheduler
//! starts it or releases it. Completion is reported through a shared status
//! word that the scheduler polls.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bitvec::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use kds_core::MAX_CUS;

use crate::bitset::Bitset;
use crate::error::SoftError;
use crate::signal::WakeSignal;

/// Status bit set by a worker when its run finished.
pub const SCU_DONE: u32 = 0x2;

/// Requests for the external worker manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SoftCommand {
    Configure { start: usize, num: usize },
    Unconfigure { start: usize, num: usize },
}

/// What a blocked worker was woken for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoftWork {
    Start(Vec<u32>),
    Release,
    TimedOut,
}

#[derive(Debug, Default)]
struct SoftWake {
    starts: u32,
    release: bool,
}

/// One registered soft worker.
#[derive(Debug)]
pub struct SoftCu {
    index: usize,
    status: AtomicU32,
    regs: Mutex<Vec<u32>>,
    wake: Mutex<SoftWake>,
    cond: Condvar,
    sched: Arc<WakeSignal>,
}

impl SoftCu {
    fn new(index: usize, sched: Arc<WakeSignal>) -> Self {
        Self {
            index,
            status: AtomicU32::new(0),
            regs: Mutex::new(Vec::new()),
            wake: Mutex::new(SoftWake::default()),
            cond: Condvar::new(),
            sched,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn lock_wake(&self) -> MutexGuard<'_, SoftWake> {
        self.wake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, regmap: &[u32]) {
        *self.regs.lock().unwrap_or_else(PoisonError::into_inner) = regmap.to_vec();
        self.status.fetch_and(!SCU_DONE, Ordering::AcqRel);
        self.lock_wake().starts += 1;
        self.cond.notify_all();
    }

    fn release(&self) {
        self.lock_wake().release = true;
        self.cond.notify_all();
    }

    /// Block until started or released. A release wins over pending starts.
    pub fn wait_for_work(&self, timeout: Duration) -> SoftWork {
        let deadline = Instant::now() + timeout;
        let mut wake = self.lock_wake();
        loop {
            if wake.release {
                return SoftWork::Release;
            }
            if wake.starts > 0 {
                wake.starts -= 1;
                let regs = self.regs.lock().unwrap_or_else(PoisonError::into_inner).clone();
                return SoftWork::Start(regs);
            }
            let now = Instant::now();
            if now >= deadline {
                return SoftWork::TimedOut;
            }
            wake = self
                .cond
                .wait_timeout(wake, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Report the current run finished.
    pub fn mark_done(&self) {
        self.status.fetch_or(SCU_DONE, Ordering::AcqRel);
        self.sched.poke();
    }

    /// Consume the done bit.
    fn take_done(&self) -> bool {
        self.status.fetch_and(!SCU_DONE, Ordering::AcqRel) & SCU_DONE != 0
    }
}

#[derive(Debug)]
struct SoftState {
    commands: VecDeque<SoftCommand>,
    cus: Vec<Option<Arc<SoftCu>>>,
    /// Indices handed to the worker manager, registered or not.
    reserved: BitVec<u32, Lsb0>,
    ncus: usize,
    closed: bool,
}

/// Command list and registry of soft workers.
#[derive(Debug)]
pub struct SoftWorkerDispatcher {
    state: Mutex<SoftState>,
    cond: Condvar,
    sched: Arc<WakeSignal>,
}

impl SoftWorkerDispatcher {
    pub(crate) fn new(sched: Arc<WakeSignal>) -> Self {
        Self {
            state: Mutex::new(SoftState {
                commands: VecDeque::new(),
                cus: vec![None; MAX_CUS],
                reserved: bitvec![u32, Lsb0; 0; MAX_CUS],
                ncus: 0,
                closed: false,
            }),
            cond: Condvar::new(),
            sched,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_range(range: &Range<usize>) -> Result<(), SoftError> {
        if range.end > MAX_CUS || range.start >= range.end {
            return Err(SoftError::OutOfRange {
                start: range.start,
                end: range.end,
                max: MAX_CUS,
            });
        }
        Ok(())
    }

    /// Reserve `range` and ask the worker manager to bring it up.
    pub fn configure(&self, range: Range<usize>) -> Result<(), SoftError> {
        Self::check_range(&range)?;
        let mut state = self.lock();
        if state.closed {
            return Err(SoftError::Closed);
        }
        // A released worker keeps its index until it deregisters.
        if let Some(idx) = range.clone().find(|i| state.reserved[*i] || state.cus[*i].is_some()) {
            warn!(cu = idx, "Rejected soft CU range {:?}", range);
            return Err(SoftError::AlreadyConfigured(idx));
        }
        for i in range.clone() {
            state.reserved.set(i, true);
        }
        state.ncus += range.len();
        state.commands.push_back(SoftCommand::Configure {
            start: range.start,
            num: range.len(),
        });
        info!("Soft CU configure {:?} ({} total)", range, state.ncus);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Release every worker in `range` and ask the manager to tear it down.
    pub fn unconfigure(&self, range: Range<usize>) -> Result<(), SoftError> {
        Self::check_range(&range)?;
        let mut state = self.lock();
        if state.closed {
            return Err(SoftError::Closed);
        }
        if let Some(idx) = range.clone().find(|i| !state.reserved[*i] || state.cus[*i].is_none()) {
            warn!(cu = idx, "Rejected soft CU unconfigure {:?}", range);
            return Err(SoftError::NotConfigured(idx));
        }
        state.ncus = state.ncus.saturating_sub(range.len());
        for i in range.clone() {
            state.reserved.set(i, false);
            if let Some(cu) = &state.cus[i] {
                cu.release();
            }
        }
        state.commands.push_back(SoftCommand::Unconfigure {
            start: range.start,
            num: range.len(),
        });
        info!("Soft CU unconfigure {:?} ({} remain)", range, state.ncus);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Next request for the worker manager. `None` on timeout or close.
    pub fn next_command(&self, timeout: Duration) -> Option<SoftCommand> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(cmd) = state.commands.pop_front() {
                return Some(cmd);
            }
            let now = Instant::now();
            if state.closed || now >= deadline {
                return None;
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Called by a worker once it is ready to run on `index`.
    pub fn register(&self, index: usize) -> Result<Arc<SoftCu>, SoftError> {
        let mut state = self.lock();
        if index >= MAX_CUS || !state.reserved[index] {
            return Err(SoftError::NotReserved(index));
        }
        if state.cus[index].is_some() {
            return Err(SoftError::AlreadyConfigured(index));
        }
        let cu = Arc::new(SoftCu::new(index, Arc::clone(&self.sched)));
        state.cus[index] = Some(Arc::clone(&cu));
        debug!(cu = index, "Soft CU registered");
        drop(state);
        self.sched.poke();
        Ok(cu)
    }

    /// Called by a released worker on its way out.
    pub fn deregister(&self, index: usize) {
        let mut state = self.lock();
        if index < MAX_CUS {
            state.cus[index] = None;
            if state.reserved[index] {
                state.reserved.set(index, false);
                state.ncus = state.ncus.saturating_sub(1);
            }
        }
        debug!(cu = index, "Soft CU deregistered");
        drop(state);
        self.sched.poke();
    }

    /// All workers in `range` are registered.
    pub fn range_configured(&self, range: Range<usize>) -> bool {
        let state = self.lock();
        range.into_iter().all(|i| i < MAX_CUS && state.cus[i].is_some())
    }

    /// No worker in `range` remains registered.
    pub fn range_released(&self, range: Range<usize>) -> bool {
        let state = self.lock();
        range.into_iter().all(|i| i >= MAX_CUS || state.cus[i].is_none())
    }

    pub fn is_registered(&self, index: usize) -> bool {
        self.lock().cus.get(index).map(|c| c.is_some()).unwrap_or(false)
    }

    /// Registered workers as a bitset over every soft CU index.
    pub fn registered(&self) -> Bitset {
        let state = self.lock();
        let mut set = Bitset::new(MAX_CUS);
        state
            .cus
            .iter()
            .enumerate()
            .filter(|(_, cu)| cu.is_some())
            .for_each(|(i, _)| set.set(i));
        set
    }

    /// Copy `regmap` to the worker and wake it.
    pub fn start(&self, index: usize, regmap: &[u32]) -> bool {
        let state = self.lock();
        match state.cus.get(index).and_then(|c| c.as_ref()) {
            Some(cu) => {
                cu.start(regmap);
                true
            }
            None => false,
        }
    }

    /// Consume the done bit of worker `index`.
    pub fn take_done(&self, index: usize) -> bool {
        let state = self.lock();
        state
            .cus
            .get(index)
            .and_then(|c| c.as_ref())
            .map(|cu| cu.take_done())
            .unwrap_or(false)
    }

    pub fn configured_count(&self) -> usize {
        self.lock().ncus
    }

    pub fn registered_count(&self) -> usize {
        self.lock().cus.iter().filter(|c| c.is_some()).count()
    }

    /// Release every worker and stop handing out commands.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for cu in state.cus.iter().flatten() {
            cu.release();
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Forget every reservation and registration.
    pub(crate) fn clear(&self) {
        let mut state = self.lock();
        for cu in state.cus.iter().flatten() {
            cu.release();
        }
        state.cus.iter_mut().for_each(|c| *c = None);
        state.reserved.fill(false);
        state.commands.clear();
        state.ncus = 0;
    }
}
