//! Execution strategies: how a job is started and how its completion is found.

mod embedded;
mod software;

pub use embedded::EmbeddedStrategy;
pub use software::SoftwareStrategy;

use kds_core::ExecMode;

use crate::exec::ExecCore;
use crate::job::Job;

/// Result of trying to start a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed to the device; the job is now running.
    Started,
    /// No free CU or slot right now; retry on a later pass.
    Deferred,
    /// The job cannot run; it ends in error.
    Failed,
}

pub trait ExecStrategy: Send {
    fn mode(&self) -> ExecMode;

    /// Try to start `job`. On `Deferred` no resource stays reserved.
    fn submit(&mut self, core: &mut ExecCore, job: &mut Job) -> SubmitOutcome;

    /// Move a running job to a terminal state if it has finished.
    fn query(&mut self, core: &mut ExecCore, job: &mut Job);
}

pub fn for_mode(mode: ExecMode) -> Box<dyn ExecStrategy> {
    match mode {
        ExecMode::Software => Box::new(SoftwareStrategy),
        ExecMode::Embedded => Box::new(EmbeddedStrategy),
    }
}
