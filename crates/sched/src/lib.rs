//! Compute-unit command scheduler.
//!
//! Jobs submitted through [`Scheduler::submit`] are matched to a free compute
//! unit and queue slot, started on the device, watched until completion or
//! hang, and retired back to the owning client. A single scheduler thread
//! drives every state transition; submitters, interrupt callbacks, copy
//! completions and the timeout ticker only enqueue work and wake it.

pub mod alloc;
pub mod bitset;
pub mod client;
pub mod cu;
pub mod device;
pub mod error;
pub mod exec;
pub mod job;
pub mod metrics;
pub mod notify;
pub mod pool;
pub mod runner;
pub mod signal;
pub mod sim;
pub mod soft;
pub mod strategy;
pub mod timer;

pub use alloc::find_free_resource;
pub use bitset::{Bitset, ResourceTable};
pub use client::{ClientContext, ClientId, ClientRegistry};
pub use device::{CopyCompletion, CuDevice, EmbeddedScheduler, Regmap};
pub use error::{AllocError, DeviceError, ResetError, SoftError, SubmitError};
pub use job::{JobHandle, JobId};
pub use metrics::{CuStats, RetiredTotals, SchedulerStats};
pub use notify::{ClientNotifier, NotificationSink};
pub use pool::CommandPool;
pub use runner::{ExecStatus, Lifecycle, Scheduler, SchedulerBuilder};
pub use sim::{CopyBehavior, SimDevice};
pub use soft::{SoftCommand, SoftCu, SoftWork, SoftWorkerDispatcher};
