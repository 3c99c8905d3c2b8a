use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use kds_core::{CmdState, Command, CuMask, ExecMode, Opcode};

use crate::device::{CopyCompletion, Regmap, COPY_DONE, COPY_FAILED};
use crate::error::AllocError;
use crate::exec::ExecCore;
use crate::job::Job;

use super::{ExecStrategy, SubmitOutcome};

/// The scheduler drives CUs directly and matches completions itself.
#[derive(Debug, Default)]
pub struct SoftwareStrategy;

impl SoftwareStrategy {
    fn start_on_cu(core: &mut ExecCore, job: &mut Job, mask: &CuMask, regmap: Regmap<'_>) -> SubmitOutcome {
        let cu = match core.acquire_cu(mask) {
            Ok(cu) => cu,
            Err(AllocError::Exhausted) => return SubmitOutcome::Deferred,
            Err(AllocError::NoValidResource) => {
                warn!(job = %job.id, "No valid CU in mask {:?}", mask.words());
                return SubmitOutcome::Failed;
            }
        };
        let Some(slot) = core.acquire_slot() else {
            core.release_cu(cu);
            return SubmitOutcome::Deferred;
        };

        job.cu_idx = Some(cu);
        job.slot_idx = Some(slot);
        core.device.configure(cu, regmap);

        let unit = &mut core.cus[cu];
        job.exec_time_remaining = unit.run_timeout_ticks;
        job.check_timeout = unit.run_timeout_ticks > 0;
        unit.usage += 1;
        unit.running_queue.push_back(job.id);
        core.device.start(cu);
        debug!(cu, slot, job = %job.id, "Job started");
        SubmitOutcome::Started
    }

    fn start_copy(core: &mut ExecCore, job: &mut Job, command: &Command) -> SubmitOutcome {
        let Command::CopyBo(req) = command else {
            return SubmitOutcome::Failed;
        };
        let Some(slot) = core.acquire_slot() else {
            return SubmitOutcome::Deferred;
        };
        job.slot_idx = Some(slot);
        let token = CopyCompletion::new(Arc::clone(&core.signal));
        job.copy = Some(token.flag());
        if let Err(e) = core.device.start_copy(req, token) {
            warn!(slot, job = %job.id, "Copy submission failed: {}", e);
            job.copy = None;
            return SubmitOutcome::Failed;
        }
        debug!(slot, job = %job.id, "Copy started");
        SubmitOutcome::Started
    }
}

impl ExecStrategy for SoftwareStrategy {
    fn mode(&self) -> ExecMode {
        ExecMode::Software
    }

    fn submit(&mut self, core: &mut ExecCore, job: &mut Job) -> SubmitOutcome {
        let Some(command) = job.command.clone() else {
            return SubmitOutcome::Failed;
        };
        match command.as_ref() {
            Command::StartCu(cmd) => Self::start_on_cu(core, job, &cmd.cu_mask, Regmap::Consecutive(&cmd.regmap)),
            Command::ExecWrite(cmd) => Self::start_on_cu(core, job, &cmd.cu_mask, Regmap::Pairs(&cmd.pairs)),
            Command::CopyBo(_) => Self::start_copy(core, job, &command),
            other => {
                warn!(job = %job.id, "{} needs the embedded strategy", other.opcode());
                SubmitOutcome::Failed
            }
        }
    }

    fn query(&mut self, core: &mut ExecCore, job: &mut Job) {
        match job.opcode() {
            Some(Opcode::CopyBo) => {
                let flag = job.copy.as_ref().map(|f| f.load(Ordering::Acquire));
                match flag {
                    Some(COPY_DONE) => job.set_state(CmdState::Completed),
                    Some(COPY_FAILED) => job.set_state(CmdState::Error),
                    _ => {}
                }
            }
            Some(Opcode::StartCu) | Some(Opcode::ExecWrite) => {
                if let Some(cu) = job.cu_idx {
                    if core.cu_done(cu, job.id) {
                        job.set_state(CmdState::Completed);
                    }
                }
            }
            _ => {}
        }
    }
}
