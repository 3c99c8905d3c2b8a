use std::path::PathBuf;

use clap::Parser;

/// Compute-unit scheduler simulator.
///
/// Configures a scheduler over a simulated device, pushes a workload
/// through it from several clients and prints the final statistics.
#[derive(Parser, Debug)]
#[command(name = "kds-sim", about = "Drive the CU scheduler against a simulated device")]
pub struct CliArgs {
    /// Path to a scheduler config file (TOML). KDS_* env vars override it.
    #[arg(long, env = "KDS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of compute units to configure
    #[arg(long, default_value = "4")]
    pub cus: u32,

    /// Number of command queue slots
    #[arg(long, default_value = "16")]
    pub slots: u32,

    /// Use completion interrupts instead of polling
    #[arg(long)]
    pub interrupts: bool,

    /// Number of concurrent clients
    #[arg(long, default_value = "2")]
    pub clients: usize,

    /// Jobs submitted by each client
    #[arg(long, default_value = "100")]
    pub jobs: usize,

    /// Simulated CU run time in milliseconds
    #[arg(long, default_value = "1")]
    pub latency_ms: u64,

    /// Every Nth job is a buffer copy instead of a CU start (0 disables)
    #[arg(long, default_value = "0")]
    pub copy_every: usize,

    /// Run timeout per job in milliseconds (0 disables hang detection)
    #[arg(long, default_value = "0")]
    pub run_timeout_ms: u64,

    /// Reset timeout per CU in milliseconds
    #[arg(long, default_value = "10")]
    pub reset_timeout_ms: u64,

    /// CUs that never complete until reset (repeatable)
    #[arg(long = "hung")]
    pub hung: Vec<usize>,

    /// Record per-state timestamps and report average run time
    #[arg(long)]
    pub timestamps: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    pub show_config: bool,
}
