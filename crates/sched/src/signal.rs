//! The scheduler's single wake path.
//!
//! Submitters, interrupt callbacks, copy completions, client aborts and the
//! timeout supervisor all funnel through [`WakeSignal`]. The scheduler thread
//! takes everything that accumulated in one [`Wakeup`].

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::job::Job;

#[derive(Debug, Default)]
struct WakeState {
    pending: VecDeque<Job>,
    intc: bool,
    check: bool,
    poke: bool,
    stop: bool,
    reinit_requested: u64,
    reinit_done: u64,
}

/// Everything taken by one scheduler wake.
#[derive(Debug, Default)]
pub struct Wakeup {
    pub pending: VecDeque<Job>,
    pub intc: bool,
    pub check: bool,
    pub stop: bool,
    pub reinit: bool,
}

/// Why [`WakeSignal::push`] handed a job back.
#[derive(Debug)]
pub enum Rejected {
    Full(Job),
    Stopped(Job),
}

impl Rejected {
    pub fn into_job(self) -> Job {
        match self {
            Rejected::Full(job) | Rejected::Stopped(job) => job,
        }
    }
}

#[derive(Debug, Default)]
pub struct WakeSignal {
    state: Mutex<WakeState>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the pending queue unless it already holds `max` jobs.
    ///
    /// Once stopped nothing is accepted: the scheduler thread drains the
    /// queue exactly once on its way out.
    pub fn push(&self, job: Job, max: usize) -> Result<(), Rejected> {
        let mut state = self.lock();
        if state.stop {
            return Err(Rejected::Stopped(job));
        }
        if state.pending.len() >= max {
            return Err(Rejected::Full(job));
        }
        state.pending.push_back(job);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// A CU raised its completion interrupt.
    pub fn interrupt(&self) {
        self.lock().intc = true;
        self.cond.notify_all();
    }

    /// The timeout supervisor ticked.
    pub fn tick(&self) {
        self.lock().check = true;
        self.cond.notify_all();
    }

    /// Something changed that the next pass should look at.
    pub fn poke(&self) {
        self.lock().poke = true;
        self.cond.notify_all();
    }

    pub fn stop(&self) {
        self.lock().stop = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stop
    }

    /// Block until there is work, or until `timeout` when given.
    /// A zero timeout takes whatever is there without blocking.
    pub fn wait(&self, timeout: Option<Duration>) -> Wakeup {
        let ready = |s: &WakeState| {
            !s.pending.is_empty()
                || s.intc
                || s.check
                || s.poke
                || s.stop
                || s.reinit_requested > s.reinit_done
        };
        let mut state = self.lock();
        match timeout {
            None => {
                while !ready(&state) {
                    state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
            Some(timeout) if !timeout.is_zero() && !ready(&state) => {
                state = self
                    .cond
                    .wait_timeout_while(state, timeout, |s| !ready(s))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            Some(_) => {}
        }
        let wake = Wakeup {
            pending: std::mem::take(&mut state.pending),
            intc: std::mem::take(&mut state.intc),
            check: std::mem::take(&mut state.check),
            stop: state.stop,
            reinit: state.reinit_requested > state.reinit_done,
        };
        state.poke = false;
        wake
    }

    /// Drain the pending queue without waiting.
    pub fn take_pending(&self) -> VecDeque<Job> {
        std::mem::take(&mut self.lock().pending)
    }

    /// Sleep up to `duration`, returning early with `false` on stop.
    pub fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.lock();
        while !state.stop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        false
    }

    /// Ask the scheduler thread to reinitialize its execution core and
    /// block until it has. Returns `false` if the scheduler stopped first.
    pub fn request_reinit(&self) -> bool {
        let mut state = self.lock();
        state.reinit_requested += 1;
        let ticket = state.reinit_requested;
        self.cond.notify_all();
        while state.reinit_done < ticket && !state.stop {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.reinit_done >= ticket
    }

    pub fn reinit_complete(&self) {
        let mut state = self.lock();
        state.reinit_done = state.reinit_requested;
        drop(state);
        self.cond.notify_all();
    }
}
