use std::collections::VecDeque;

use crate::job::JobId;

/// Scheduler-side view of one hardware compute unit.
#[derive(Debug, Clone)]
pub struct ComputeUnit {
    pub index: usize,
    /// Jobs this CU may still accept before it is marked busy.
    pub credits: u32,
    pub max_credits: u32,
    /// Supervisor ticks before a running job is declared hung; 0 disables.
    pub run_timeout_ticks: u32,
    /// Reset-done checks before a reset is declared failed.
    pub reset_retries: u32,
    pub usage: u64,
    /// Completions reported by the device but not yet matched to a job.
    pub done_cnt: u32,
    /// Dispatched jobs in start order. Only the head is checked for completion.
    pub running_queue: VecDeque<JobId>,
    /// Set when a reset failed; the CU stays unusable until reconfigured.
    pub hung: bool,
}

impl ComputeUnit {
    pub fn new(index: usize, credits: u32) -> Self {
        Self {
            index,
            credits,
            max_credits: credits,
            run_timeout_ticks: 0,
            reset_retries: 1,
            usage: 0,
            done_cnt: 0,
            running_queue: VecDeque::new(),
            hung: false,
        }
    }

    /// Take one credit. Returns true when the CU has none left.
    pub fn take_credit(&mut self) -> bool {
        self.credits = self.credits.saturating_sub(1);
        self.credits == 0
    }

    pub fn refund_credit(&mut self) {
        self.credits = (self.credits + 1).min(self.max_credits);
    }

    /// Drop `job` from the running queue wherever it sits.
    pub fn forget(&mut self, job: JobId) -> bool {
        match self.running_queue.iter().position(|id| *id == job) {
            Some(pos) => {
                self.running_queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_credit_marks_busy_on_first_take() {
        let mut cu = ComputeUnit::new(0, 1);
        assert!(cu.take_credit());
        cu.refund_credit();
        assert_eq!(cu.credits, 1);
    }

    #[test]
    fn credits_allow_sharing() {
        let mut cu = ComputeUnit::new(0, 3);
        assert!(!cu.take_credit());
        assert!(!cu.take_credit());
        assert!(cu.take_credit());
        cu.refund_credit();
        cu.refund_credit();
        cu.refund_credit();
        cu.refund_credit();
        assert_eq!(cu.credits, 3, "refund never exceeds the maximum");
    }

    #[test]
    fn forget_removes_from_middle() {
        let mut cu = ComputeUnit::new(0, 2);
        cu.running_queue.extend([JobId(1), JobId(2), JobId(3)]);
        assert!(cu.forget(JobId(2)));
        assert!(!cu.forget(JobId(9)));
        assert_eq!(cu.running_queue, VecDeque::from(vec![JobId(1), JobId(3)]));
    }
}
