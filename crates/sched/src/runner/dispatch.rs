use tracing::{debug, error};

use kds_core::{CmdState, Command, ExecMode, Opcode};

use crate::job::Job;
use crate::strategy::{self, SubmitOutcome};

use super::core::ExecStatus;
use super::execution::Engine;

impl Engine {
    /// Advance one job as far as it can go in this pass.
    /// Advance one job. `intc` reports whether this pass was woken by a CU
    /// interrupt; interrupt-driven jobs are only checked then, or when the
    /// device already reported completions their CU has not consumed.
    pub(super) fn step(&mut self, job: &mut Job, intc: bool) {
        self.update_state(job);
        if job.state == CmdState::Queued {
            self.queued_to_running(job);
        }
        if job.state == CmdState::Running && (intc || job.polled || self.banked(job)) {
            self.strategy.query(&mut self.core, job);
        }
        if job.state == CmdState::Timeout {
            self.reset_cu(job);
        }
    }

    fn banked(&self, job: &Job) -> bool {
        job.cu_idx
            .and_then(|cu| self.core.cus.get(cu))
            .map(|unit| unit.done_cnt > 0)
            .unwrap_or(false)
    }

    /// Abort queued jobs whose owner went away, or that have no CU while
    /// the device is flushing.
    fn update_state(&mut self, job: &mut Job) {
        if job.state != CmdState::Queued {
            return;
        }
        let owner_aborted = job.client.as_ref().map(|c| c.is_aborted()).unwrap_or(false);
        let flushing = self.shared.exec_status() == ExecStatus::Flushing && job.cu_idx.is_none();
        if owner_aborted || flushing {
            debug!(job = %job.id, owner_aborted, flushing, "Aborting queued job");
            job.set_state(CmdState::Abort);
        }
    }

    fn queued_to_running(&mut self, job: &mut Job) {
        let Some(command) = job.command.clone() else {
            job.set_state(CmdState::Error);
            return;
        };
        match command.as_ref() {
            Command::Configure(cmd) => {
                // This job is the only one ingested; nothing may wait behind it.
                let in_flight = self.shared.running() > 1 || self.shared.signal.pending_len() > 0;
                match self.core.configure(cmd, in_flight) {
                    Ok(()) => {
                        self.strategy = strategy::for_mode(self.core.mode);
                        job.set_state(CmdState::Running);
                        job.set_state(CmdState::Completed);
                    }
                    Err(e) => {
                        error!(job = %job.id, "Configure failed: {}", e);
                        job.set_state(CmdState::Error);
                    }
                }
            }
            Command::InitCu(cmd) => match self.core.init_cus(cmd) {
                Ok(_) => {
                    job.set_state(CmdState::Running);
                    job.set_state(CmdState::Completed);
                }
                Err(e) => {
                    error!(job = %job.id, "CU init failed: {}", e);
                    job.set_state(CmdState::Error);
                }
            },
            _ => match self.strategy.submit(&mut self.core, job) {
                SubmitOutcome::Started => {
                    if self.core.polling
                        || self.core.mode == ExecMode::Embedded
                        || job.opcode() == Some(Opcode::CopyBo)
                    {
                        job.polled = true;
                        self.core.poll += 1;
                    }
                    job.set_state(CmdState::Running);
                }
                SubmitOutcome::Deferred => {}
                SubmitOutcome::Failed => job.set_state(CmdState::Error),
            },
        }
    }
}
