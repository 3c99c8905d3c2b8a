//! Scheduler runner: the public handle and the scheduler thread.
//!
//! Split into focused submodules:
//! - `core`: Scheduler handle, builder, admission and accessors
//! - `execution`: the scheduler thread loop, ingestion and retirement
//! - `dispatch`: per-job state advancement and configuration commands
//! - `reset`: CU reset after a hang and full-device reset

mod core;
mod dispatch;
mod execution;
mod reset;
#[cfg(test)]
mod tests;

pub use self::core::{ExecStatus, Lifecycle, Scheduler, SchedulerBuilder};
