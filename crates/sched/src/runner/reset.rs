use tracing::{error, info, warn};

use kds_core::CmdState;

use crate::error::ResetError;
use crate::job::Job;

use super::core::{ExecStatus, Lifecycle, Scheduler};
use super::execution::Engine;

impl Engine {
    /// Reset the CU of a timed-out job and classify the outcome.
    ///
    /// The CU is polled for reset completion up to its retry budget. The job
    /// keeps `Timeout` when the reset went through and becomes `NoResponse`
    /// otherwise, in which case the CU is taken out of service.
    pub(super) fn reset_cu(&mut self, job: &mut Job) {
        let Some(cu) = job.cu_idx else {
            return;
        };
        if cu >= self.core.cus.len() {
            return;
        }

        let device = std::sync::Arc::clone(&self.core.device);
        let retries = self.core.cus[cu].reset_retries.max(1);
        let interval = self.shared.config.reset_poll_interval();
        device.reset(cu);
        let mut reset_ok = false;
        for _ in 0..retries {
            if device.reset_done(cu) {
                reset_ok = true;
                break;
            }
            if !self.shared.signal.pause(interval) {
                break;
            }
        }

        let unit = &mut self.core.cus[cu];
        unit.forget(job.id);
        unit.done_cnt = 0;
        self.core.release_cu(cu);

        if reset_ok {
            warn!(cu, job = %job.id, "CU reset after timeout");
        } else {
            error!(cu, job = %job.id, "CU not responding after reset, taking it out of service");
            self.core.cus[cu].hung = true;
            self.core.resources.cu_valid.clear(cu);
            job.set_state(CmdState::NoResponse);
        }
    }
}

impl Scheduler {
    /// Full-device reset.
    ///
    /// Closes admission, waits for pending then running work to drain, and
    /// flushes queued jobs if that is not enough. Fails with `Busy` and
    /// reopens admission when work is still in flight; otherwise the
    /// scheduler returns to the unconfigured state.
    pub fn reset(&self) -> Result<(), ResetError> {
        let shared = &self.shared;
        if shared.lifecycle() != Lifecycle::Running {
            return Err(ResetError::Stopped);
        }
        info!("Device reset requested");
        shared.set_exec_status(ExecStatus::Stopped);

        let retries = shared.config.reset_drain_retries;
        let wait = shared.config.reset_drain_wait();
        let drained = |check: &dyn Fn() -> bool| -> Result<bool, ResetError> {
            for _ in 0..retries {
                if check() {
                    return Ok(true);
                }
                if !shared.signal.pause(wait) {
                    return Err(ResetError::Stopped);
                }
            }
            Ok(check())
        };

        drained(&|| shared.signal.pending_len() == 0)?;
        let mut idle = drained(&|| shared.signal.pending_len() == 0 && shared.running() == 0)?;

        if !idle {
            warn!("Device busy, flushing queued commands");
            shared.set_exec_status(ExecStatus::Flushing);
            shared.signal.poke();
            if !shared.signal.pause(shared.config.flush_wait()) {
                return Err(ResetError::Stopped);
            }
            idle = shared.signal.pending_len() == 0 && shared.running() == 0;
        }

        if !idle {
            let pending = shared.signal.pending_len();
            let running = shared.running();
            shared.set_exec_status(ExecStatus::Normal);
            warn!("Device reset refused: {} pending, {} running", pending, running);
            return Err(ResetError::Busy { pending, running });
        }

        if !shared.signal.request_reinit() {
            return Err(ResetError::Stopped);
        }
        shared.set_exec_status(ExecStatus::Normal);
        info!("Device reset complete");
        Ok(())
    }
}
