//! Delivery of retirement events to clients.

use std::sync::atomic::{AtomicU64, Ordering};

use kds_core::CmdState;
use tracing::debug;

use crate::client::ClientContext;
use crate::job::JobId;

/// Receives one call per retired job, after the scheduler has released the
/// job's resources and published its statistics.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, client: &ClientContext, job: JobId, state: CmdState);
}

/// Bumps the owning client's event counter and wakes its waiters.
#[derive(Debug, Default)]
pub struct ClientNotifier {
    delivered: AtomicU64,
}

impl ClientNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl NotificationSink for ClientNotifier {
    fn notify(&self, client: &ClientContext, job: JobId, state: CmdState) {
        debug!(client = %client.id(), job = %job, state = %state, "Job retired");
        client.record_event();
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    #[test]
    fn notifier_bumps_client_events() {
        let client = ClientContext::new(Weak::new());
        let notifier = ClientNotifier::new();
        notifier.notify(&client, JobId(1), CmdState::Completed);
        notifier.notify(&client, JobId(2), CmdState::Abort);
        assert_eq!(client.events(), 2);
        assert_eq!(notifier.delivered(), 2);
    }
}
