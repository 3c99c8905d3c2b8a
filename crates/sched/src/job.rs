//! Job records and the handles callers hold while a job is in flight.

use std::fmt;
use std::sync::atomic::AtomicU8;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kds_core::{CmdState, Command, Opcode};

use crate::client::ClientContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Whether `from -> to` is an edge of the job state machine.
pub fn is_valid_transition(from: CmdState, to: CmdState) -> bool {
    use CmdState::*;
    matches!(
        (from, to),
        (New, Queued)
            | (New, Abort)
            | (Queued, Running)
            | (Queued, Error)
            | (Queued, Abort)
            | (Running, Completed)
            | (Running, Error)
            | (Running, Timeout)
            | (Running, Abort)
            | (Timeout, NoResponse)
    )
}

/// One submitted unit of work. Owned by exactly one queue at a time and
/// mutated only by the scheduler thread once ingested.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub command: Option<Arc<Command>>,
    pub state: CmdState,
    pub cu_idx: Option<usize>,
    /// Soft CU held by a soft-kernel start; never an index into the hardware CUs.
    pub scu_idx: Option<usize>,
    pub slot_idx: Option<usize>,
    /// Remaining supervisor ticks; 0 means no timeout configured.
    pub exec_time_remaining: u32,
    pub check_timeout: bool,
    pub client: Option<Arc<ClientContext>>,
    pub capture_timestamps: bool,
    /// Counted in the scheduler's poll count while running.
    pub polled: bool,
    /// Completion flags written by an async copy token.
    pub copy: Option<Arc<AtomicU8>>,
    pub(crate) status: Option<Arc<JobStatus>>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            id: JobId(0),
            command: None,
            state: CmdState::New,
            cu_idx: None,
            scu_idx: None,
            slot_idx: None,
            exec_time_remaining: 0,
            check_timeout: false,
            client: None,
            capture_timestamps: false,
            polled: false,
            copy: None,
            status: None,
        }
    }
}

impl Job {
    pub fn opcode(&self) -> Option<Opcode> {
        self.command.as_ref().map(|c| c.opcode())
    }

    /// Move to `to`, mirroring the change into the caller-visible status.
    pub fn set_state(&mut self, to: CmdState) {
        debug_assert!(
            is_valid_transition(self.state, to),
            "{}: invalid transition {} -> {}",
            self.id,
            self.state,
            to
        );
        self.state = to;
        if let Some(status) = &self.status {
            status.update(to, self.cu_idx.or(self.scu_idx), self.capture_timestamps);
        }
    }

    /// Clear every field so the record can be reused.
    pub fn reset(&mut self) {
        *self = Job::default();
    }
}

// ── Caller-visible status ────────────────────────────────────

#[derive(Debug)]
struct StatusInner {
    state: CmdState,
    cu: Option<usize>,
    retired: bool,
    timestamps: Vec<(CmdState, DateTime<Utc>)>,
}

/// Status cell shared between a job record and its handle.
#[derive(Debug)]
pub(crate) struct JobStatus {
    inner: Mutex<StatusInner>,
    cond: Condvar,
}

impl JobStatus {
    pub(crate) fn new(capture_timestamps: bool) -> Self {
        let mut timestamps = Vec::new();
        if capture_timestamps {
            timestamps.push((CmdState::New, Utc::now()));
        }
        Self {
            inner: Mutex::new(StatusInner {
                state: CmdState::New,
                cu: None,
                retired: false,
                timestamps,
            }),
            cond: Condvar::new(),
        }
    }

    fn update(&self, state: CmdState, cu: Option<usize>, capture: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.state = state;
        inner.cu = cu;
        if capture {
            inner.timestamps.push((state, Utc::now()));
        }
        drop(inner);
        self.cond.notify_all();
    }

    pub(crate) fn retire(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.retired = true;
        drop(inner);
        self.cond.notify_all();
    }

    fn wait_while<F>(&self, timeout: Duration, mut pending: F) -> bool
    where
        F: FnMut(&StatusInner) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        while pending(&inner) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Handle returned from submission.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    status: Arc<JobStatus>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, status: Arc<JobStatus>) -> Self {
        Self { id, status }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> CmdState {
        self.status.inner.lock().unwrap_or_else(PoisonError::into_inner).state
    }

    /// CU the job was dispatched to, if any.
    pub fn cu(&self) -> Option<usize> {
        self.status.inner.lock().unwrap_or_else(PoisonError::into_inner).cu
    }

    pub fn is_retired(&self) -> bool {
        self.status.inner.lock().unwrap_or_else(PoisonError::into_inner).retired
    }

    /// Per-state wall-clock times, recorded only when capture was requested.
    pub fn timestamps(&self) -> Vec<(CmdState, DateTime<Utc>)> {
        self.status
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .timestamps
            .clone()
    }

    /// Block until the job is retired. Returns its terminal state, or
    /// `None` if `timeout` elapsed first.
    pub fn wait(&self, timeout: Duration) -> Option<CmdState> {
        if self.status.wait_while(timeout, |s| !s.retired) {
            Some(self.state())
        } else {
            None
        }
    }

    /// Block until the job reaches `state` or retires.
    pub fn wait_for(&self, state: CmdState, timeout: Duration) -> bool {
        self.status
            .wait_while(timeout, |s| s.state != state && !s.retired);
        self.state() == state
    }
}
