use tracing::{debug, warn};

use kds_core::{CmdState, Command, ExecMode};

use crate::error::AllocError;
use crate::exec::ExecCore;
use crate::job::Job;

use super::{ExecStrategy, SubmitOutcome};

/// Completion is tracked by the embedded scheduler, or by soft workers for
/// soft-kernel commands. Locally only slots and soft CUs are accounted.
#[derive(Debug, Default)]
pub struct EmbeddedStrategy;

impl EmbeddedStrategy {
    fn start(core: &mut ExecCore, job: &mut Job, slot: usize, command: &Command) -> Result<bool, String> {
        match command {
            Command::SkConfig(cmd) => core.soft.configure(cmd.range()).map(|_| true).map_err(|e| e.to_string()),
            Command::SkUnconfig(cmd) => core.soft.unconfigure(cmd.range()).map(|_| true).map_err(|e| e.to_string()),
            Command::SkStart(cmd) => {
                let scu = match core.acquire_soft_cu(&cmd.cu_mask) {
                    Ok(scu) => scu,
                    Err(AllocError::Exhausted) => return Ok(false),
                    Err(e) => return Err(e.to_string()),
                };
                if !core.soft.start(scu, &cmd.regmap) {
                    core.release_soft_cu(scu);
                    return Err(format!("soft cu {} vanished", scu));
                }
                job.scu_idx = Some(scu);
                Ok(true)
            }
            Command::StartCu(_) | Command::ExecWrite(_) | Command::CopyBo(_) => match &core.embedded {
                Some(embedded) => embedded.submit(slot, command).map(|_| true).map_err(|e| e.to_string()),
                None => Err("no embedded scheduler attached".into()),
            },
            Command::Configure(_) | Command::InitCu(_) => Err("configuration command reached the device".into()),
        }
    }
}

impl ExecStrategy for EmbeddedStrategy {
    fn mode(&self) -> ExecMode {
        ExecMode::Embedded
    }

    fn submit(&mut self, core: &mut ExecCore, job: &mut Job) -> SubmitOutcome {
        let Some(command) = job.command.clone() else {
            return SubmitOutcome::Failed;
        };
        let Some(slot) = core.acquire_slot() else {
            return SubmitOutcome::Deferred;
        };
        match Self::start(core, job, slot, &command) {
            Ok(true) => {
                job.slot_idx = Some(slot);
                debug!(slot, job = %job.id, "{} submitted", command.opcode());
                SubmitOutcome::Started
            }
            Ok(false) => {
                core.release_slot(slot);
                SubmitOutcome::Deferred
            }
            Err(e) => {
                warn!(slot, job = %job.id, "{} failed: {}", command.opcode(), e);
                job.slot_idx = Some(slot);
                SubmitOutcome::Failed
            }
        }
    }

    fn query(&mut self, core: &mut ExecCore, job: &mut Job) {
        let Some(command) = job.command.clone() else {
            return;
        };
        match command.as_ref() {
            Command::SkConfig(cmd) => {
                if core.soft.range_configured(cmd.range()) {
                    job.set_state(CmdState::Completed);
                }
            }
            Command::SkUnconfig(cmd) => {
                if core.soft.range_released(cmd.range()) {
                    job.set_state(CmdState::Completed);
                }
            }
            // The soft CU itself is given back when the job is released.
            Command::SkStart(_) => {
                let Some(scu) = job.scu_idx else {
                    return;
                };
                if core.soft.take_done(scu) {
                    job.set_state(CmdState::Completed);
                } else if !core.soft.is_registered(scu) {
                    warn!(scu, job = %job.id, "Soft CU left before finishing");
                    job.set_state(CmdState::Error);
                }
            }
            _ => {
                let (Some(slot), Some(embedded)) = (job.slot_idx, core.embedded.as_ref()) else {
                    return;
                };
                match embedded.poll(slot) {
                    Some(true) => job.set_state(CmdState::Completed),
                    Some(false) => job.set_state(CmdState::Error),
                    None => {}
                }
            }
        }
    }
}
