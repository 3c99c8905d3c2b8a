//! In-memory device used by the simulator binary and the tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use kds_core::{CopyBoCmd, Command};

use crate::device::{CopyCompletion, CuDevice, EmbeddedScheduler, Regmap};
use crate::error::DeviceError;

/// How the simulated copy engine treats new copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyBehavior {
    /// Complete successfully during submission.
    #[default]
    Immediate,
    /// Hold tokens until [`SimDevice::finish_copies`].
    Manual,
    /// Refuse submission.
    Reject,
}

#[derive(Debug, Default)]
struct SimCu {
    regs: Vec<u32>,
    /// Due time of each started run; `None` waits for a manual completion.
    in_flight: VecDeque<Option<Instant>>,
    manual_done: u32,
    hung: bool,
    no_irq: bool,
    reset_fails: bool,
    resets: u32,
    started: u64,
}

#[derive(Debug)]
struct SimState {
    cus: Vec<SimCu>,
    auto_complete: bool,
    latency: Duration,
    copy: CopyBehavior,
    held_copies: Vec<CopyCompletion>,
    copies: u64,
    slots: HashMap<usize, (Instant, bool)>,
    embedded_reject: bool,
}

/// Simulated compute units, copy engine and embedded scheduler.
#[derive(Debug)]
pub struct SimDevice {
    state: Mutex<SimState>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// CUs complete immediately and reset successfully.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                cus: Vec::new(),
                auto_complete: true,
                latency: Duration::ZERO,
                copy: CopyBehavior::Immediate,
                held_copies: Vec::new(),
                copies: 0,
                slots: HashMap::new(),
                embedded_reject: false,
            }),
        }
    }

    /// CUs only complete through [`SimDevice::complete`].
    pub fn manual() -> Self {
        let dev = Self::new();
        dev.lock().auto_complete = false;
        dev
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    pub fn with_copy_behavior(self, copy: CopyBehavior) -> Self {
        self.lock().copy = copy;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_cu<R>(&self, cu: usize, f: impl FnOnce(&mut SimCu) -> R) -> R {
        let mut state = self.lock();
        if state.cus.len() <= cu {
            state.cus.resize_with(cu + 1, SimCu::default);
        }
        f(&mut state.cus[cu])
    }

    /// Finish the oldest run on `cu`.
    pub fn complete(&self, cu: usize) {
        self.with_cu(cu, |c| {
            if c.in_flight.pop_front().is_some() {
                c.manual_done += 1;
            }
        });
    }

    /// A hung CU never reports completion.
    pub fn set_hung(&self, cu: usize, hung: bool) {
        self.with_cu(cu, |c| c.hung = hung);
    }

    pub fn set_reset_fails(&self, cu: usize, fails: bool) {
        self.with_cu(cu, |c| c.reset_fails = fails);
    }

    pub fn set_no_interrupt(&self, cu: usize) {
        self.with_cu(cu, |c| c.no_irq = true);
    }

    pub fn set_embedded_reject(&self, reject: bool) {
        self.lock().embedded_reject = reject;
    }

    pub fn started(&self, cu: usize) -> u64 {
        self.with_cu(cu, |c| c.started)
    }

    pub fn resets(&self, cu: usize) -> u32 {
        self.with_cu(cu, |c| c.resets)
    }

    pub fn registers(&self, cu: usize) -> Vec<u32> {
        self.with_cu(cu, |c| c.regs.clone())
    }

    pub fn copies(&self) -> u64 {
        self.lock().copies
    }

    /// Complete every held copy token.
    pub fn finish_copies(&self, ok: bool) -> usize {
        let held = std::mem::take(&mut self.lock().held_copies);
        let n = held.len();
        for token in held {
            token.complete(ok);
        }
        n
    }
}

impl CuDevice for SimDevice {
    fn supports_interrupts(&self, cu: usize) -> bool {
        self.with_cu(cu, |c| !c.no_irq)
    }

    fn configure(&self, cu: usize, regmap: Regmap<'_>) {
        self.with_cu(cu, |c| match regmap {
            Regmap::Consecutive(regs) => c.regs = regs.to_vec(),
            Regmap::Pairs(pairs) => {
                for &(offset, value) in pairs {
                    let idx = (offset / 4) as usize;
                    if c.regs.len() <= idx {
                        c.regs.resize(idx + 1, 0);
                    }
                    c.regs[idx] = value;
                }
            }
        });
    }

    fn start(&self, cu: usize) {
        let mut state = self.lock();
        let due = state.auto_complete.then(|| Instant::now() + state.latency);
        if state.cus.len() <= cu {
            state.cus.resize_with(cu + 1, SimCu::default);
        }
        let c = &mut state.cus[cu];
        c.started += 1;
        c.in_flight.push_back(due);
    }

    fn poll_done(&self, cu: usize) -> u32 {
        let now = Instant::now();
        self.with_cu(cu, |c| {
            if c.hung {
                return 0;
            }
            let mut done = std::mem::take(&mut c.manual_done);
            while let Some(Some(due)) = c.in_flight.front() {
                if *due > now {
                    break;
                }
                c.in_flight.pop_front();
                done += 1;
            }
            done
        })
    }

    fn reset(&self, cu: usize) {
        debug!(cu, "Simulated CU reset");
        self.with_cu(cu, |c| {
            c.resets += 1;
            c.in_flight.clear();
            c.manual_done = 0;
            if !c.reset_fails {
                c.hung = false;
            }
        });
    }

    fn reset_done(&self, cu: usize) -> bool {
        self.with_cu(cu, |c| !c.reset_fails)
    }

    fn start_copy(&self, req: &CopyBoCmd, done: CopyCompletion) -> Result<(), DeviceError> {
        let mut state = self.lock();
        match state.copy {
            CopyBehavior::Reject => Err(DeviceError::CopyRejected(format!(
                "{} bytes from bo {} to bo {}",
                req.size, req.src_handle, req.dst_handle
            ))),
            CopyBehavior::Manual => {
                state.copies += 1;
                state.held_copies.push(done);
                Ok(())
            }
            CopyBehavior::Immediate => {
                state.copies += 1;
                drop(state);
                done.complete(true);
                Ok(())
            }
        }
    }
}

impl EmbeddedScheduler for SimDevice {
    fn submit(&self, slot: usize, command: &Command) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if state.embedded_reject {
            return Err(DeviceError::EmbeddedRejected {
                slot,
                reason: format!("{} refused", command.opcode()),
            });
        }
        let due = Instant::now() + state.latency;
        state.slots.insert(slot, (due, true));
        Ok(())
    }

    fn poll(&self, slot: usize) -> Option<bool> {
        let mut state = self.lock();
        match state.slots.get(&slot) {
            Some((due, ok)) if *due <= Instant::now() => {
                let ok = *ok;
                state.slots.remove(&slot);
                Some(ok)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_complete_reports_done() {
        let dev = SimDevice::new();
        dev.start(0);
        dev.start(0);
        assert_eq!(dev.poll_done(0), 2);
        assert_eq!(dev.poll_done(0), 0);
        assert_eq!(dev.started(0), 2);
    }

    #[test]
    fn manual_completion() {
        let dev = SimDevice::manual();
        dev.start(1);
        assert_eq!(dev.poll_done(1), 0);
        dev.complete(1);
        assert_eq!(dev.poll_done(1), 1);
    }

    #[test]
    fn hung_cu_recovers_on_reset() {
        let dev = SimDevice::new();
        dev.set_hung(0, true);
        dev.start(0);
        assert_eq!(dev.poll_done(0), 0);
        dev.reset(0);
        assert!(dev.reset_done(0));
        assert_eq!(dev.resets(0), 1);
        dev.start(0);
        assert_eq!(dev.poll_done(0), 1);
    }

    #[test]
    fn pair_regmap_writes_offsets() {
        let dev = SimDevice::new();
        dev.configure(0, Regmap::Pairs(&[(0x10, 7), (0x0, 1)]));
        assert_eq!(dev.registers(0), vec![1, 0, 0, 0, 7]);
    }

    #[test]
    fn embedded_slots_complete() {
        let dev = SimDevice::new();
        let cmd = Command::start_cu(kds_core::CuMask::from_word(1), vec![]);
        EmbeddedScheduler::submit(&dev, 3, &cmd).unwrap();
        assert_eq!(EmbeddedScheduler::poll(&dev, 3), Some(true));
        assert_eq!(EmbeddedScheduler::poll(&dev, 3), None);

        dev.set_embedded_reject(true);
        assert!(EmbeddedScheduler::submit(&dev, 4, &cmd).is_err());
    }
}
