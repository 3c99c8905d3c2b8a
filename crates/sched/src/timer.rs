use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use crate::signal::WakeSignal;

/// Periodic ticker that asks the scheduler to age running jobs.
///
/// It only raises the check flag; job state is never touched from here.
#[derive(Debug)]
pub struct TimeoutSupervisor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutSupervisor {
    pub fn spawn(sched: Arc<WakeSignal>, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("kds-timeout".into())
            .spawn(move || {
                let (lock, cond) = &*thread_stop;
                let mut stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
                loop {
                    let (guard, timeout) = cond
                        .wait_timeout_while(stopped, interval, |s| !*s)
                        .unwrap_or_else(PoisonError::into_inner);
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    if timeout.timed_out() {
                        sched.tick();
                    }
                }
                debug!("Timeout supervisor exiting");
            })?;
        info!("Timeout supervisor started ({:?} tick)", interval);
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        let (lock, cond) = &*self.stop;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
