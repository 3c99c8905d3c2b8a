//! Scheduler error types.

use thiserror::Error;

/// Synchronous admission failures. A rejected command never enters the
/// state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("command requests no compute unit")]
    EmptyCuMask,

    #[error("pending queue full ({0} jobs)")]
    QueueFull(usize),

    #[error("scheduler is draining, admission closed")]
    Draining,

    #[error("scheduler stopped")]
    Stopped,

    #[error("client {0} aborted")]
    ClientAborted(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

/// Resource search failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Every acceptable resource is in use; retry later.
    #[error("all requested resources are busy")]
    Exhausted,

    /// The request names no valid resource at all.
    #[error("no valid resource requested")]
    NoValidResource,
}

/// Full-device reset failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResetError {
    #[error("device busy: {pending} pending, {running} running")]
    Busy { pending: usize, running: usize },

    #[error("scheduler stopped")]
    Stopped,
}

/// Failures reported by device collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("copy rejected: {0}")]
    CopyRejected(String),

    #[error("embedded scheduler rejected slot {slot}: {reason}")]
    EmbeddedRejected { slot: usize, reason: String },
}

/// Soft compute unit range and registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SoftError {
    #[error("soft cu range {start}..{end} exceeds {max}")]
    OutOfRange { start: usize, end: usize, max: usize },

    #[error("soft cu {0} already configured")]
    AlreadyConfigured(usize),

    #[error("soft cu {0} not configured")]
    NotConfigured(usize),

    #[error("soft cu {0} was not reserved")]
    NotReserved(usize),

    #[error("soft worker dispatcher closed")]
    Closed,
}
