//! Recycling arena for job records.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::job::Job;

/// Free list of job records. Records are allocated on demand and returned
/// on retirement, so steady-state submission does no allocation.
#[derive(Debug, Default)]
pub struct CommandPool {
    free: Mutex<Vec<Job>>,
    allocated: AtomicUsize,
}

impl CommandPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cleared record, recycled when one is available.
    pub fn acquire(&self) -> Job {
        let recycled = self.free.lock().unwrap_or_else(PoisonError::into_inner).pop();
        match recycled {
            Some(job) => job,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Job::default()
            }
        }
    }

    pub fn release(&self, mut job: Job) {
        job.reset();
        self.free.lock().unwrap_or_else(PoisonError::into_inner).push(job);
    }

    /// Records ever allocated.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Records currently handed out.
    pub fn outstanding(&self) -> usize {
        self.allocated().saturating_sub(self.free_count())
    }
}
