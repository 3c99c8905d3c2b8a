use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{debug, info};

use kds_core::{CmdState, Command, ConfigureCmd, InitCuCmd, SchedulerConfig};

use crate::client::{ClientContext, ClientId, ClientRegistry};
use crate::device::{CuDevice, EmbeddedScheduler};
use crate::error::SubmitError;
use crate::exec::ExecCore;
use crate::job::{JobHandle, JobId, JobStatus};
use crate::metrics::SchedulerStats;
use crate::notify::{ClientNotifier, NotificationSink};
use crate::pool::CommandPool;
use crate::signal::{Rejected, WakeSignal};
use crate::soft::SoftWorkerDispatcher;

use super::execution::Engine;

/// Admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ExecStatus {
    Normal = 0,
    /// Admission closed while a reset drains in-flight work.
    Stopped = 1,
    /// Admission closed and queued jobs without a CU are aborted.
    Flushing = 2,
}

impl ExecStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ExecStatus::Stopped,
            2 => ExecStatus::Flushing,
            _ => ExecStatus::Normal,
        }
    }
}

/// Scheduler thread lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Lifecycle {
    Uninitialized = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopping,
            3 => Lifecycle::Stopped,
            _ => Lifecycle::Uninitialized,
        }
    }
}

/// State shared between the handle, producers and the scheduler thread.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) signal: Arc<WakeSignal>,
    pub(crate) stats: RwLock<SchedulerStats>,
    exec_status: AtomicU8,
    lifecycle: AtomicU8,
    /// Ingested jobs not yet retired.
    pub(crate) num_running: AtomicUsize,
    pub(crate) clients: ClientRegistry,
    pub(crate) soft: Arc<SoftWorkerDispatcher>,
    pub(crate) pool: CommandPool,
    next_id: AtomicU64,
}

impl Shared {
    pub(crate) fn exec_status(&self) -> ExecStatus {
        ExecStatus::from_u8(self.exec_status.load(Ordering::Acquire))
    }

    pub(crate) fn set_exec_status(&self, status: ExecStatus) {
        self.exec_status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    pub(crate) fn running(&self) -> usize {
        self.num_running.load(Ordering::Acquire)
    }
}

/// Configures and starts a [`Scheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    device: Arc<dyn CuDevice>,
    embedded: Option<Arc<dyn EmbeddedScheduler>>,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl SchedulerBuilder {
    /// Attach the on-device scheduler used in embedded mode.
    pub fn embedded(mut self, embedded: Arc<dyn EmbeddedScheduler>) -> Self {
        self.embedded = Some(embedded);
        self
    }

    /// Replace the default [`ClientNotifier`].
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Spawn the scheduler thread.
    pub fn start(self) -> std::io::Result<Scheduler> {
        let signal = Arc::new(WakeSignal::new());
        let soft = Arc::new(SoftWorkerDispatcher::new(Arc::clone(&signal)));
        let stats = SchedulerStats {
            num_slots: self.config.default_slots,
            free_slots: self.config.default_slots,
            ..SchedulerStats::default()
        };
        let shared = Arc::new(Shared {
            config: self.config.clone(),
            signal: Arc::clone(&signal),
            stats: RwLock::new(stats),
            exec_status: AtomicU8::new(ExecStatus::Normal as u8),
            lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
            num_running: AtomicUsize::new(0),
            clients: ClientRegistry::new(),
            soft: Arc::clone(&soft),
            pool: CommandPool::new(),
            next_id: AtomicU64::new(1),
        });

        let core = ExecCore::new(self.config, self.device, self.embedded, soft, signal);
        let sink = self.sink.unwrap_or_else(|| Arc::new(ClientNotifier::new()));
        let engine = Engine::new(Arc::clone(&shared), core, sink);

        shared.set_lifecycle(Lifecycle::Running);
        let thread = std::thread::Builder::new()
            .name("kds-sched".into())
            .spawn(move || engine.run());
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                shared.set_lifecycle(Lifecycle::Stopped);
                return Err(e);
            }
        };

        let admin = shared.clients.register(Arc::downgrade(&shared.signal));
        Ok(Scheduler {
            shared,
            admin,
            thread: Mutex::new(Some(thread)),
        })
    }
}

/// Handle to a running command scheduler. Dropping it stops the scheduler
/// thread after force-retiring everything still in flight.
pub struct Scheduler {
    pub(super) shared: Arc<Shared>,
    /// Owner of configuration commands issued through this handle.
    admin: Arc<ClientContext>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn builder(config: SchedulerConfig, device: Arc<dyn CuDevice>) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            device,
            embedded: None,
            sink: None,
        }
    }

    /// Start with the default notifier and no embedded scheduler.
    pub fn start(config: SchedulerConfig, device: Arc<dyn CuDevice>) -> std::io::Result<Self> {
        Self::builder(config, device).start()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn register_client(&self) -> Arc<ClientContext> {
        let client = self.shared.clients.register(Arc::downgrade(&self.shared.signal));
        debug!(client = %client.id(), "Client registered");
        client
    }

    pub fn unregister_client(&self, id: ClientId) {
        if let Some(client) = self.shared.clients.unregister(id) {
            if client.outstanding() > 0 {
                client.abort();
            }
        }
    }

    /// Queue `command` for `client`.
    pub fn submit(&self, client: &Arc<ClientContext>, command: Command) -> Result<JobHandle, SubmitError> {
        self.submit_inner(client, command, self.shared.config.capture_timestamps)
    }

    /// Queue `command` and record the time each state is entered.
    pub fn submit_with_timestamps(
        &self,
        client: &Arc<ClientContext>,
        command: Command,
    ) -> Result<JobHandle, SubmitError> {
        self.submit_inner(client, command, true)
    }

    fn submit_inner(
        &self,
        client: &Arc<ClientContext>,
        command: Command,
        capture_timestamps: bool,
    ) -> Result<JobHandle, SubmitError> {
        let shared = &self.shared;
        if shared.lifecycle() != Lifecycle::Running {
            return Err(SubmitError::Stopped);
        }
        if shared.exec_status() != ExecStatus::Normal {
            return Err(SubmitError::Draining);
        }
        if client.is_aborted() {
            return Err(SubmitError::ClientAborted(client.id().to_string()));
        }
        Self::validate(&command)?;

        let id = JobId(shared.next_id.fetch_add(1, Ordering::Relaxed));
        let opcode = command.opcode();
        let status = Arc::new(JobStatus::new(capture_timestamps));
        let mut job = shared.pool.acquire();
        job.id = id;
        job.command = Some(Arc::new(command));
        job.state = CmdState::New;
        job.client = Some(Arc::clone(client));
        job.capture_timestamps = capture_timestamps;
        job.status = Some(Arc::clone(&status));

        client.exec_submitted();
        if let Err(rejected) = shared.signal.push(job, shared.config.max_pending) {
            client.exec_retired();
            let err = match rejected {
                Rejected::Full(_) => SubmitError::QueueFull(shared.config.max_pending),
                Rejected::Stopped(_) => SubmitError::Stopped,
            };
            shared.pool.release(rejected.into_job());
            return Err(err);
        }
        debug!(job = %id, opcode = %opcode, "Job submitted");
        Ok(JobHandle::new(id, status))
    }

    fn validate(command: &Command) -> Result<(), SubmitError> {
        match command {
            Command::Configure(cmd) => cmd
                .validate()
                .map_err(|e| SubmitError::InvalidCommand(e.to_string())),
            Command::InitCu(cmd) if cmd.cu_mask.is_empty() => Err(SubmitError::EmptyCuMask),
            Command::SkConfig(cmd) | Command::SkUnconfig(cmd) if cmd.num_cus == 0 => Err(
                SubmitError::InvalidCommand("soft cu range is empty".into()),
            ),
            _ => match command.cu_mask() {
                Some(mask) if mask.is_empty() => Err(SubmitError::EmptyCuMask),
                _ => Ok(()),
            },
        }
    }

    /// Submit a configure command on behalf of the scheduler's own client.
    pub fn configure(&self, cmd: ConfigureCmd) -> Result<JobHandle, SubmitError> {
        self.submit(&self.admin, Command::Configure(cmd))
    }

    /// Submit a CU init command on behalf of the scheduler's own client.
    pub fn init_cus(&self, cmd: InitCuCmd) -> Result<JobHandle, SubmitError> {
        self.submit(&self.admin, Command::InitCu(cmd))
    }

    /// Abort every not-yet-running job of `client` on the next pass.
    pub fn abort_client(&self, client: &ClientContext) {
        info!(client = %client.id(), "Client abort requested ({} outstanding)", client.outstanding());
        client.abort();
    }

    /// Completion interrupt from `cu`.
    pub fn cu_interrupt(&self, cu: usize) {
        debug!(cu, "CU interrupt");
        self.shared.signal.interrupt();
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared
            .stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or(serde_json::Value::Null)
    }

    /// Clients with outstanding jobs.
    pub fn live_clients(&self) -> Vec<ClientId> {
        self.shared.clients.live_clients()
    }

    /// Whether any job is pending or in flight.
    pub fn is_busy(&self) -> bool {
        self.shared.signal.pending_len() > 0 || self.shared.running() > 0
    }

    pub fn exec_status(&self) -> ExecStatus {
        self.shared.exec_status()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    pub fn soft_workers(&self) -> Arc<SoftWorkerDispatcher> {
        Arc::clone(&self.shared.soft)
    }

    /// Job records currently handed out by the pool.
    pub fn pool_outstanding(&self) -> usize {
        self.shared.pool.outstanding()
    }

    /// Stop the scheduler thread and wait for it. Idempotent.
    pub fn shutdown(&self) {
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(thread) = thread else {
            return;
        };
        info!("Scheduler shutdown requested");
        self.shared.set_lifecycle(Lifecycle::Stopping);
        self.shared.set_exec_status(ExecStatus::Stopped);
        self.shared.signal.stop();
        let _ = thread.join();
        self.shared.set_lifecycle(Lifecycle::Stopped);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
