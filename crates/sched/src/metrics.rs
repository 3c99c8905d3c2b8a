use chrono::{DateTime, Utc};
use serde::Serialize;

use kds_core::{CmdState, ExecMode};

use crate::runner::ExecStatus;

/// Per-CU view in a stats snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CuStats {
    pub index: usize,
    pub valid: bool,
    pub busy: bool,
    pub initialized: bool,
    pub usage: u64,
    pub credits: u32,
    pub running: usize,
    pub hung: bool,
}

/// Retired jobs by terminal state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetiredTotals {
    pub completed: u64,
    pub error: u64,
    pub abort: u64,
    pub timeout: u64,
    pub noresponse: u64,
}

impl RetiredTotals {
    pub fn record(&mut self, state: CmdState) {
        match state {
            CmdState::Completed => self.completed += 1,
            CmdState::Error => self.error += 1,
            CmdState::Abort => self.abort += 1,
            CmdState::Timeout => self.timeout += 1,
            CmdState::NoResponse => self.noresponse += 1,
            _ => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.completed + self.error + self.abort + self.timeout + self.noresponse
    }
}

/// Snapshot published by the scheduler thread after every pass.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub configured: bool,
    pub mode: ExecMode,
    pub polling: bool,
    pub exec_status: ExecStatus,
    pub num_slots: usize,
    pub free_slots: usize,
    /// Submitted but not yet ingested.
    pub pending: usize,
    /// Ingested and not yet retired.
    pub running: usize,
    pub cus: Vec<CuStats>,
    pub soft_cus: usize,
    pub retired: RetiredTotals,
    pub passes: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self {
            configured: false,
            mode: ExecMode::Software,
            polling: true,
            exec_status: ExecStatus::Normal,
            num_slots: 0,
            free_slots: 0,
            pending: 0,
            running: 0,
            cus: Vec::new(),
            soft_cus: 0,
            retired: RetiredTotals::default(),
            passes: 0,
            updated_at: Utc::now(),
        }
    }
}

impl SchedulerStats {
    pub fn valid_cus(&self) -> usize {
        self.cus.iter().filter(|c| c.valid).count()
    }

    pub fn busy_cus(&self) -> usize {
        self.cus.iter().filter(|c| c.busy).count()
    }
}
