use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use kds_core::{CmdState, Command, ConfigureCmd, CopyBoCmd, CuMask, ExecMode, InitCuCmd};
use kds_sched::{JobHandle, Scheduler, SubmitError};

use crate::cli::CliArgs;

/// How long a single job may take before the simulator gives up on it.
const JOB_WAIT: Duration = Duration::from_secs(30);
/// Back-off while the admission queue is full.
const BACKOFF: Duration = Duration::from_millis(50);

/// Outcome of a simulator run.
#[derive(Debug, Default, Serialize)]
pub struct WorkloadReport {
    pub clients: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub queue_full_retries: u64,
    /// Retired jobs per terminal state.
    pub outcomes: BTreeMap<String, u64>,
    /// Jobs still unretired when the simulator stopped waiting.
    pub unfinished: u64,
    pub avg_run_us: Option<f64>,
    pub elapsed_ms: u128,
}

#[derive(Debug, Default)]
struct ClientTally {
    submitted: u64,
    rejected: u64,
    queue_full_retries: u64,
    outcomes: BTreeMap<String, u64>,
    unfinished: u64,
    run_us: Vec<i64>,
}

fn await_admin(handle: JobHandle, what: &str) -> Result<()> {
    match handle.wait(JOB_WAIT) {
        Some(CmdState::Completed) => Ok(()),
        Some(state) => bail!("{} ended in state {}", what, state),
        None => bail!("{} did not finish within {:?}", what, JOB_WAIT),
    }
}

fn job_command(args: &CliArgs, mask: &CuMask, n: usize) -> Command {
    if args.copy_every > 0 && n % args.copy_every == args.copy_every - 1 {
        return Command::CopyBo(CopyBoCmd {
            src_handle: n as u32,
            dst_handle: n as u32 + 1,
            size: 4096,
            src_offset: 0,
            dst_offset: 0,
        });
    }
    Command::start_cu(mask.clone(), vec![n as u32, 0, 0, 0])
}

/// Configure the scheduler, push the workload through it and tally results.
pub fn run(sched: &Scheduler, args: &CliArgs) -> Result<WorkloadReport> {
    let started = Instant::now();
    let mode = ExecMode::Software;
    await_admin(
        sched.configure(ConfigureCmd::new(args.cus, args.slots, !args.interrupts, mode))?,
        "configure",
    )?;

    let indices: Vec<usize> = (0..args.cus as usize).collect();
    let mask = CuMask::from_indices(&indices)?;
    if args.run_timeout_ms > 0 {
        await_admin(
            sched.init_cus(InitCuCmd {
                cu_mask: mask.clone(),
                run_timeout: Duration::from_millis(args.run_timeout_ms),
                reset_timeout: Duration::from_millis(args.reset_timeout_ms),
                regmap: Vec::new(),
            })?,
            "init",
        )?;
    }

    let polling = sched.stats().polling;
    info!(
        "Running {} jobs from {} clients on {} CUs (polling={})",
        args.jobs * args.clients,
        args.clients,
        args.cus,
        polling
    );

    let done = AtomicBool::new(false);
    let tallies = thread::scope(|scope| {
        // Simulated interrupt line: the device completes on its own, the
        // scheduler only learns about it from these.
        if !polling {
            let done = &done;
            let period = Duration::from_millis(args.latency_ms.max(1));
            scope.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    thread::sleep(period);
                    for cu in 0..args.cus as usize {
                        sched.cu_interrupt(cu);
                    }
                }
            });
        }

        let workers: Vec<_> = (0..args.clients)
            .map(|_| {
                let mask = &mask;
                scope.spawn(move || run_client(sched, args, mask))
            })
            .collect();
        let tallies: Vec<_> = workers
            .into_iter()
            .map(|w| w.join().map_err(|_| anyhow!("client thread panicked")))
            .collect();
        done.store(true, Ordering::Release);
        tallies
    });

    let mut report = WorkloadReport {
        clients: args.clients,
        ..WorkloadReport::default()
    };
    let mut run_us = Vec::new();
    for tally in tallies {
        let tally = tally?;
        report.submitted += tally.submitted;
        report.rejected += tally.rejected;
        report.queue_full_retries += tally.queue_full_retries;
        report.unfinished += tally.unfinished;
        for (state, n) in tally.outcomes {
            *report.outcomes.entry(state).or_default() += n;
        }
        run_us.extend(tally.run_us);
    }
    if !run_us.is_empty() {
        report.avg_run_us = Some(run_us.iter().sum::<i64>() as f64 / run_us.len() as f64);
    }
    report.elapsed_ms = started.elapsed().as_millis();
    Ok(report)
}

fn run_client(sched: &Scheduler, args: &CliArgs, mask: &CuMask) -> ClientTally {
    let client = sched.register_client();
    let mut tally = ClientTally::default();
    let mut handles = Vec::with_capacity(args.jobs);

    let mut n = 0;
    while n < args.jobs {
        let command = job_command(args, mask, n);
        let submitted = if args.timestamps {
            sched.submit_with_timestamps(&client, command)
        } else {
            sched.submit(&client, command)
        };
        match submitted {
            Ok(handle) => {
                handles.push(handle);
                tally.submitted += 1;
                n += 1;
            }
            Err(SubmitError::QueueFull(_)) => {
                tally.queue_full_retries += 1;
                client.wait_event(client.events(), BACKOFF);
            }
            Err(e) => {
                warn!(client = %client.id(), "Submission rejected: {}", e);
                tally.rejected += (args.jobs - n) as u64;
                break;
            }
        }
    }

    for handle in handles {
        let Some(state) = handle.wait(JOB_WAIT) else {
            debug!(job = %handle.id(), "Job still in flight, giving up");
            tally.unfinished += 1;
            continue;
        };
        *tally.outcomes.entry(state.to_string()).or_default() += 1;
        if state == CmdState::Completed && args.timestamps {
            let stamps = handle.timestamps();
            let at = |s: CmdState| stamps.iter().find(|(st, _)| *st == s).map(|(_, t)| *t);
            if let (Some(start), Some(end)) = (at(CmdState::Running), at(CmdState::Completed)) {
                if let Some(us) = (end - start).num_microseconds() {
                    tally.run_us.push(us);
                }
            }
        }
    }

    sched.unregister_client(client.id());
    tally
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clap::Parser;
    use kds_core::SchedulerConfig;
    use kds_sched::SimDevice;

    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["kds-sim"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn polling_workload_completes() {
        let args = args(&["--cus", "2", "--jobs", "20", "--latency-ms", "0", "--copy-every", "5"]);
        let sched = Scheduler::start(SchedulerConfig::default(), Arc::new(SimDevice::new())).unwrap();
        let report = run(&sched, &args).unwrap();
        assert_eq!(report.submitted, 40);
        assert_eq!(report.outcomes.get("completed"), Some(&40));
        assert_eq!(report.unfinished, 0);
        assert_eq!(sched.stats().retired.completed, 41);
    }

    #[test]
    fn interrupt_workload_completes() {
        let args = args(&["--cus", "1", "--clients", "1", "--jobs", "5", "--interrupts", "--timestamps"]);
        let dev = Arc::new(SimDevice::new().with_latency(Duration::from_millis(1)));
        let sched = Scheduler::start(SchedulerConfig::default(), dev).unwrap();
        let report = run(&sched, &args).unwrap();
        assert_eq!(report.outcomes.get("completed"), Some(&5));
        assert!(report.avg_run_us.is_some());
    }

    #[test]
    fn copy_every_interleaves() {
        let args = args(&["--copy-every", "3"]);
        let mask = CuMask::from_word(1);
        assert!(matches!(job_command(&args, &mask, 2), Command::CopyBo(_)));
        assert!(matches!(job_command(&args, &mask, 3), Command::StartCu(_)));
    }
}
