//! Execution core: CU and slot tables plus the device collaborators.
//!
//! Owned by the scheduler thread. Configuration commands rebuild it; the
//! execution strategies borrow it to allocate and start work.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use kds_core::{ConfigureCmd, CuMask, ExecMode, InitCuCmd, SchedulerConfig, MASK_BITS};

use crate::alloc::{acquire_slot, find_free_resource, release_slot};
use crate::bitset::ResourceTable;
use crate::cu::ComputeUnit;
use crate::device::{CuDevice, EmbeddedScheduler, Regmap};
use crate::error::AllocError;
use crate::job::JobId;
use crate::metrics::CuStats;
use crate::signal::WakeSignal;
use crate::soft::SoftWorkerDispatcher;
use crate::timer::TimeoutSupervisor;

pub struct ExecCore {
    pub(crate) config: SchedulerConfig,
    pub(crate) device: Arc<dyn CuDevice>,
    pub(crate) embedded: Option<Arc<dyn EmbeddedScheduler>>,
    pub(crate) soft: Arc<SoftWorkerDispatcher>,
    pub(crate) signal: Arc<WakeSignal>,
    pub configured: bool,
    pub mode: ExecMode,
    pub polling: bool,
    pub resources: ResourceTable,
    pub cus: Vec<ComputeUnit>,
    /// Running jobs that need the scheduler to poll for completion.
    pub poll: usize,
    timer: Option<TimeoutSupervisor>,
}

impl ExecCore {
    pub(crate) fn new(
        config: SchedulerConfig,
        device: Arc<dyn CuDevice>,
        embedded: Option<Arc<dyn EmbeddedScheduler>>,
        soft: Arc<SoftWorkerDispatcher>,
        signal: Arc<WakeSignal>,
    ) -> Self {
        let resources = ResourceTable::new(0, config.default_slots);
        Self {
            config,
            device,
            embedded,
            soft,
            signal,
            configured: false,
            mode: ExecMode::Software,
            polling: true,
            resources,
            cus: Vec::new(),
            poll: 0,
            timer: None,
        }
    }

    /// Back to the unconfigured state with the default slot count.
    pub(crate) fn reinit(&mut self) {
        self.stop_timer();
        self.configured = false;
        self.mode = ExecMode::Software;
        self.polling = true;
        self.resources = ResourceTable::new(0, self.config.default_slots);
        self.cus.clear();
        self.poll = 0;
        self.soft.clear();
    }

    // ── Allocation ────────────────────────────────────────────

    /// Reserve a CU from `mask`, taking one credit.
    pub fn acquire_cu(&mut self, mask: &CuMask) -> Result<usize, AllocError> {
        let idx = find_free_resource(
            mask.words(),
            &self.resources.cu_valid,
            &self.resources.cu_busy,
        )?;
        if self.cus[idx].take_credit() {
            self.resources.cu_busy.set(idx);
        }
        Ok(idx)
    }

    pub fn release_cu(&mut self, idx: usize) {
        if let Some(cu) = self.cus.get_mut(idx) {
            cu.refund_credit();
            self.resources.cu_busy.clear(idx);
        }
    }

    pub fn acquire_slot(&mut self) -> Option<usize> {
        acquire_slot(&mut self.resources.slots).ok()
    }

    pub fn release_slot(&mut self, idx: usize) {
        release_slot(&mut self.resources.slots, idx);
    }

    pub fn acquire_soft_cu(&mut self, mask: &CuMask) -> Result<usize, AllocError> {
        let registered = self.soft.registered();
        let idx = find_free_resource(mask.words(), &registered, &self.resources.scu_busy)?;
        self.resources.scu_busy.set(idx);
        Ok(idx)
    }

    pub fn release_soft_cu(&mut self, idx: usize) {
        self.resources.scu_busy.clear(idx);
    }

    /// Whether the head of `cu`'s running queue is `job` and has finished.
    /// On success the head is popped and the CU's credit refunded.
    pub fn cu_done(&mut self, cu: usize, job: JobId) -> bool {
        let Some(unit) = self.cus.get_mut(cu) else {
            return false;
        };
        if unit.running_queue.front() != Some(&job) {
            return false;
        }
        if unit.done_cnt == 0 {
            unit.done_cnt += self.device.poll_done(cu);
        }
        if unit.done_cnt == 0 {
            return false;
        }
        unit.done_cnt -= 1;
        unit.running_queue.pop_front();
        self.release_cu(cu);
        true
    }

    // ── Configuration commands ────────────────────────────────

    /// Size the CU and slot tables and pick the completion mode.
    /// `in_flight` reports whether any other job is pending or queued.
    pub fn configure(&mut self, cmd: &ConfigureCmd, in_flight: bool) -> Result<(), String> {
        if self.configured {
            return Err("already configured, reset required".into());
        }
        if in_flight {
            return Err("other commands in flight".into());
        }
        cmd.validate().map_err(|e| e.to_string())?;
        if cmd.mode == ExecMode::Embedded && self.embedded.is_none() {
            return Err("embedded mode needs an embedded scheduler".into());
        }

        let num_cus = cmd.num_cus as usize;
        let num_slots = cmd.num_slots as usize;
        self.resources = ResourceTable::new(num_cus, num_slots);
        self.cus = (0..num_cus)
            .map(|i| ComputeUnit::new(i, self.config.cu_credits))
            .collect();
        for i in 0..num_cus {
            if cmd.free_running.contains(&(i as u32)) {
                debug!(cu = i, "Free-running CU left invalid");
                continue;
            }
            self.resources.cu_valid.set(i);
        }

        let mut polling = cmd.polling;
        if !polling {
            if cmd.mode == ExecMode::Embedded {
                polling = true;
            } else if num_cus > MASK_BITS {
                warn!("{} CUs exceed interrupt capacity, falling back to polling", num_cus);
                polling = true;
            } else if let Some(cu) = (0..num_cus).find(|i| !self.device.supports_interrupts(*i)) {
                warn!(cu, "CU has no interrupt support, falling back to polling");
                polling = true;
            }
        }

        self.polling = polling;
        self.mode = cmd.mode;
        self.configured = true;
        info!(
            "Configured {} CUs ({} valid), {} slots, mode={}, polling={}",
            num_cus,
            self.resources.cu_valid.count(),
            num_slots,
            self.mode,
            self.polling
        );
        Ok(())
    }

    /// One-time CU setup. Returns how many CUs were initialized.
    pub fn init_cus(&mut self, cmd: &InitCuCmd) -> Result<usize, String> {
        if !self.configured {
            return Err("scheduler not configured".into());
        }
        if !cmd.run_timeout.is_zero() && cmd.reset_timeout.is_zero() {
            return Err("run timeout without a reset timeout".into());
        }

        let ticks = self.config.run_timeout_ticks(cmd.run_timeout);
        let retries = self.config.reset_timeout_retries(cmd.reset_timeout);
        let mut initialized = 0;
        for idx in cmd.cu_mask.iter() {
            if idx >= self.cus.len()
                || !self.resources.cu_valid.test(idx)
                || self.resources.cu_busy.test(idx)
                || self.resources.cu_init.test(idx)
            {
                debug!(cu = idx, "Skipping CU init");
                continue;
            }
            self.device.configure(idx, Regmap::Consecutive(&cmd.regmap));
            let cu = &mut self.cus[idx];
            cu.run_timeout_ticks = ticks;
            cu.reset_retries = retries;
            self.resources.cu_init.set(idx);
            initialized += 1;
        }

        if ticks > 0 {
            self.ensure_timer()?;
        }
        debug!("Initialized {} CUs, timeout {} ticks", initialized, ticks);
        Ok(initialized)
    }

    fn ensure_timer(&mut self) -> Result<(), String> {
        if self.timer.is_none() {
            let timer = TimeoutSupervisor::spawn(Arc::clone(&self.signal), self.config.tick_interval())
                .map_err(|e| {
                    error!("Failed to start timeout supervisor: {}", e);
                    e.to_string()
                })?;
            self.timer = Some(timer);
        }
        Ok(())
    }

    pub(crate) fn stop_timer(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
    }

    pub fn cu_stats(&self) -> Vec<CuStats> {
        self.cus
            .iter()
            .map(|cu| CuStats {
                index: cu.index,
                valid: self.resources.cu_valid.test(cu.index),
                busy: self.resources.cu_busy.test(cu.index),
                initialized: self.resources.cu_init.test(cu.index),
                usage: cu.usage,
                credits: cu.credits,
                running: cu.running_queue.len(),
                hung: cu.hung,
            })
            .collect()
    }
}
