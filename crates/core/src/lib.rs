pub mod command;
pub mod config;
pub mod error;

pub use command::*;
pub use config::{Config, SchedulerConfig};
pub use error::*;
