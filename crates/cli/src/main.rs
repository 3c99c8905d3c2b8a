mod cli;
mod workload;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use kds_core::config::{load_dotenv, Config};
use kds_sched::{Scheduler, SimDevice};

use crate::cli::CliArgs;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    load_dotenv();
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    if args.show_config {
        println!("{}", serde_json::to_string_pretty(&config.summary_json())?);
        return Ok(());
    }
    config.log_summary();

    let device = Arc::new(SimDevice::new().with_latency(Duration::from_millis(args.latency_ms)));
    for &cu in &args.hung {
        if cu >= args.cus as usize {
            warn!(cu, "Ignoring hung CU outside the configured range");
            continue;
        }
        if args.run_timeout_ms == 0 {
            warn!(cu, "Hung CU without --run-timeout-ms, its jobs will never finish");
        }
        device.set_hung(cu, true);
    }

    let sched = Scheduler::start(config.scheduler.clone(), device)
        .context("failed to start scheduler thread")?;
    let report = workload::run(&sched, &args).context("workload failed")?;
    info!(
        "Workload finished in {}ms: {} submitted, {} rejected",
        report.elapsed_ms, report.submitted, report.rejected
    );

    let output = serde_json::json!({
        "workload": report,
        "stats": sched.stats_json(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    sched.shutdown();
    Ok(())
}
