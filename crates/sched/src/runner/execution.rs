use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use kds_core::CmdState;

use crate::exec::ExecCore;
use crate::job::Job;
use crate::metrics::{RetiredTotals, SchedulerStats};
use crate::notify::NotificationSink;
use crate::signal::Wakeup;
use crate::strategy::{self, ExecStrategy};

use super::core::Shared;

/// State owned by the scheduler thread.
pub(crate) struct Engine {
    pub(super) shared: Arc<Shared>,
    pub(super) core: ExecCore,
    pub(super) strategy: Box<dyn ExecStrategy>,
    sink: Arc<dyn NotificationSink>,
    /// Ingested jobs in submission order.
    pub(super) run_queue: VecDeque<Job>,
    retired: RetiredTotals,
    passes: u64,
}

impl Engine {
    pub(crate) fn new(shared: Arc<Shared>, core: ExecCore, sink: Arc<dyn NotificationSink>) -> Self {
        let strategy = strategy::for_mode(core.mode);
        Self {
            shared,
            core,
            strategy,
            sink,
            run_queue: VecDeque::new(),
            retired: RetiredTotals::default(),
            passes: 0,
        }
    }

    /// Scheduler thread body. Returns once stop is requested and every job
    /// still in flight has been force-retired.
    pub(crate) fn run(mut self) {
        info!(
            "Scheduler started: max_pending={}, default_slots={}",
            self.shared.config.max_pending, self.shared.config.default_slots
        );
        self.publish_stats();

        let mut again = false;
        loop {
            let timeout = if again {
                Some(Duration::ZERO)
            } else if self.core.poll > 0 {
                Some(self.shared.config.poll_interval())
            } else {
                None
            };
            let wake = self.shared.signal.wait(timeout);
            if wake.stop {
                self.drain(wake.pending);
                break;
            }
            if wake.reinit {
                self.reinit();
            }
            let progressed = self.pass(wake);
            // A CU or slot freed late in the pass may unblock jobs skipped earlier in it.
            again = progressed && self.run_queue.iter().any(|j| j.state == CmdState::Queued);
        }

        self.core.stop_timer();
        self.shared.soft.close();
        info!("Scheduler stopped");
    }

    /// One wake cycle: ingest, age, advance every job, retire finished ones.
    /// Returns whether any job changed state.
    fn pass(&mut self, wake: Wakeup) -> bool {
        self.passes += 1;
        self.ingest(wake.pending);
        if wake.check {
            self.age_running();
        }

        let mut progressed = false;
        let mut finished = Vec::new();
        for _ in 0..self.run_queue.len() {
            let Some(mut job) = self.run_queue.pop_front() else {
                break;
            };
            let before = job.state;
            self.step(&mut job, wake.intc);
            progressed |= job.state != before;
            if job.state.is_terminal() {
                self.release(&mut job);
                finished.push(job);
            } else {
                self.run_queue.push_back(job);
            }
        }

        self.publish_stats();
        self.deliver(finished);
        progressed
    }

    fn ingest(&mut self, pending: VecDeque<Job>) {
        for mut job in pending {
            job.set_state(CmdState::Queued);
            self.shared.num_running.fetch_add(1, Ordering::AcqRel);
            debug!(job = %job.id, "Job queued");
            self.run_queue.push_back(job);
        }
    }

    /// Count down every running job that has a timeout budget.
    fn age_running(&mut self) {
        for job in self.run_queue.iter_mut() {
            if job.state != CmdState::Running || !job.check_timeout {
                continue;
            }
            job.exec_time_remaining = job.exec_time_remaining.saturating_sub(1);
            if job.exec_time_remaining == 0 {
                warn!(cu = ?job.cu_idx, job = %job.id, "Job timed out");
                job.set_state(CmdState::Timeout);
            }
        }
    }

    /// Give back the job's slot, soft CU and its place in the running count.
    fn release(&mut self, job: &mut Job) {
        if let Some(slot) = job.slot_idx.take() {
            self.core.release_slot(slot);
        }
        if let Some(scu) = job.scu_idx.take() {
            self.core.release_soft_cu(scu);
        }
        if job.polled {
            self.core.poll = self.core.poll.saturating_sub(1);
            job.polled = false;
        }
        self.shared.num_running.fetch_sub(1, Ordering::AcqRel);
        self.retired.record(job.state);
        debug!(job = %job.id, state = %job.state, "Job finished");
    }

    /// Notify owners and recycle records. Runs after stats are published so
    /// a woken waiter sees the post-retirement snapshot.
    fn deliver(&mut self, finished: Vec<Job>) {
        for mut job in finished {
            let status = job.status.take();
            if let Some(client) = job.client.take() {
                client.exec_retired();
                self.sink.notify(&client, job.id, job.state);
            }
            self.shared.pool.release(job);
            if let Some(status) = status {
                status.retire();
            }
        }
    }

    pub(super) fn publish_stats(&self) {
        let core = &self.core;
        let stats = SchedulerStats {
            configured: core.configured,
            mode: core.mode,
            polling: core.polling,
            exec_status: self.shared.exec_status(),
            num_slots: core.resources.slots.len(),
            free_slots: core.resources.free_slots(),
            pending: self.shared.signal.pending_len(),
            running: self.shared.running(),
            cus: core.cu_stats(),
            soft_cus: self.shared.soft.registered_count(),
            retired: self.retired.clone(),
            passes: self.passes,
            updated_at: Utc::now(),
        };
        *self.shared.stats.write().unwrap_or_else(PoisonError::into_inner) = stats;
    }

    /// Force-retire everything: the remaining pending jobs and the run-queue.
    fn drain(&mut self, mut pending: VecDeque<Job>) {
        pending.extend(self.shared.signal.take_pending());
        self.ingest(pending);

        let mut finished = Vec::new();
        let mut stale = 0;
        while let Some(mut job) = self.run_queue.pop_front() {
            if matches!(job.state, CmdState::Queued | CmdState::Running) {
                if let Some(unit) = job.cu_idx.and_then(|cu| self.core.cus.get_mut(cu)) {
                    unit.forget(job.id);
                }
                job.set_state(CmdState::Abort);
                stale += 1;
            }
            self.release(&mut job);
            finished.push(job);
        }
        if stale > 0 {
            warn!("Recycling {} stale commands", stale);
        }
        self.publish_stats();
        self.deliver(finished);
    }

    /// Return to the unconfigured state after a full-device reset.
    fn reinit(&mut self) {
        if !self.run_queue.is_empty() {
            warn!("Reinitializing with {} jobs in flight", self.run_queue.len());
            self.drain(VecDeque::new());
        }
        self.core.reinit();
        self.strategy = strategy::for_mode(self.core.mode);
        self.publish_stats();
        self.shared.signal.reinit_complete();
        info!("Execution core reinitialized");
    }
}
