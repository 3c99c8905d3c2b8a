#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use kds_core::{
        CmdState, Command, ConfigureCmd, CopyBoCmd, CuMask, ExecMode, SchedulerConfig, SkRangeCmd,
        StartCuCmd,
    };

    use crate::error::{ResetError, SubmitError};
    use crate::runner::{ExecStatus, Lifecycle, Scheduler};
    use crate::sim::{CopyBehavior, SimDevice};
    use crate::soft::{SoftCommand, SoftWork};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval_ms: 20,
            poll_interval_us: 200,
            reset_drain_retries: 3,
            reset_drain_wait_ms: 5,
            flush_wait_ms: 20,
            ..SchedulerConfig::default()
        }
    }

    fn started(dev: Arc<SimDevice>, config: SchedulerConfig) -> Scheduler {
        Scheduler::start(config, dev).unwrap()
    }

    fn configure(sched: &Scheduler, num_cus: u32, num_slots: u32, polling: bool) {
        let handle = sched
            .configure(ConfigureCmd::new(num_cus, num_slots, polling, ExecMode::Software))
            .unwrap();
        assert_eq!(handle.wait(WAIT), Some(CmdState::Completed));
    }

    fn start_cu(mask: u32) -> Command {
        Command::start_cu(CuMask::from_word(mask), vec![0xa, 0xb])
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn scheduler_creation() {
        let sched = started(Arc::new(SimDevice::new()), test_config());
        assert_eq!(sched.lifecycle(), Lifecycle::Running);
        assert_eq!(sched.exec_status(), ExecStatus::Normal);
        let stats = sched.stats();
        assert!(!stats.configured);
        assert_eq!(stats.num_slots, 16);
        assert_eq!(stats.running, 0);
        assert!(!sched.is_busy());
    }

    #[test]
    fn start_cu_completes_in_polling_mode() {
        let dev = Arc::new(SimDevice::new());
        let sched = started(dev.clone(), test_config());
        configure(&sched, 2, 4, true);
        let client = sched.register_client();

        let handle = sched.submit(&client, start_cu(0b11)).unwrap();
        assert_eq!(handle.wait(WAIT), Some(CmdState::Completed));
        assert_eq!(handle.cu(), Some(0));
        assert_eq!(dev.started(0), 1);
        assert_eq!(dev.registers(0), vec![0xa, 0xb]);

        let stats = sched.stats();
        assert_eq!(stats.retired.completed, 2, "configure and start both completed");
        assert_eq!(stats.cus[0].usage, 1);
        assert_eq!(stats.busy_cus(), 0);
        assert_eq!(stats.free_slots, 4);
        assert_eq!(client.outstanding(), 0);
        assert_eq!(client.events(), 1);
    }

    #[test]
    fn interrupt_mode_completes_on_interrupt() {
        let dev = Arc::new(SimDevice::manual());
        let sched = started(dev.clone(), test_config());
        configure(&sched, 1, 4, false);
        assert!(!sched.stats().polling);
        let client = sched.register_client();

        let handle = sched.submit(&client, start_cu(1)).unwrap();
        assert!(handle.wait_for(CmdState::Running, WAIT));
        assert_eq!(handle.wait(Duration::from_millis(20)), None);

        dev.complete(0);
        sched.cu_interrupt(0);
        assert_eq!(handle.wait(WAIT), Some(CmdState::Completed));
    }

    #[test]
    fn queued_job_waits_for_busy_cu() {
        let dev = Arc::new(SimDevice::manual());
        let sched = started(dev.clone(), test_config());
        configure(&sched, 1, 4, true);
        let client = sched.register_client();

        let first = sched.submit(&client, start_cu(1)).unwrap();
        assert!(first.wait_for(CmdState::Running, WAIT));
        let second = sched.submit(&client, start_cu(1)).unwrap();
        assert!(wait_until(|| sched.stats().running == 2));
        assert_eq!(second.state(), CmdState::Queued);
        assert_eq!(sched.live_clients(), vec![client.id()]);
        assert!(sched.is_busy());

        dev.complete(0);
        assert_eq!(first.wait(WAIT), Some(CmdState::Completed));
        assert!(second.wait_for(CmdState::Running, WAIT));
        dev.complete(0);
        assert_eq!(second.wait(WAIT), Some(CmdState::Completed));
    }

    #[test]
    fn credits_share_a_cu_in_order() {
        let dev = Arc::new(SimDevice::manual());
        let config = SchedulerConfig { cu_credits: 2, ..test_config() };
        let sched = started(dev.clone(), config);
        configure(&sched, 1, 4, true);
        let client = sched.register_client();

        let a = sched.submit(&client, start_cu(1)).unwrap();
        let b = sched.submit(&client, start_cu(1)).unwrap();
        assert!(a.wait_for(CmdState::Running, WAIT));
        assert!(b.wait_for(CmdState::Running, WAIT));
        assert!(wait_until(|| sched.stats().cus[0].running == 2));
        assert!(sched.stats().cus[0].busy);

        dev.complete(0);
        assert_eq!(a.wait(WAIT), Some(CmdState::Completed));
        assert_eq!(b.state(), CmdState::Running);
        dev.complete(0);
        assert_eq!(b.wait(WAIT), Some(CmdState::Completed));
    }

    #[test]
    fn admission_errors() {
        let sched = started(Arc::new(SimDevice::new()), test_config());
        let client = sched.register_client();
        assert_eq!(sched.submit(&client, start_cu(0)).unwrap_err(), SubmitError::EmptyCuMask);
        assert!(matches!(
            sched.configure(ConfigureCmd::new(0, 4, true, ExecMode::Software)),
            Err(SubmitError::InvalidCommand(_))
        ));
        assert!(matches!(
            sched.submit(&client, Command::SkConfig(SkRangeCmd { start_cu: 0, num_cus: 0 })),
            Err(SubmitError::InvalidCommand(_))
        ));
        assert_eq!(sched.stats().retired.total(), 0);
    }

    #[test]
    fn zero_capacity_queue_is_full() {
        let config = SchedulerConfig { max_pending: 0, ..test_config() };
        let sched = started(Arc::new(SimDevice::new()), config);
        let client = sched.register_client();
        assert_eq!(sched.submit(&client, start_cu(1)).unwrap_err(), SubmitError::QueueFull(0));
        assert_eq!(client.outstanding(), 0);
        assert_eq!(sched.pool_outstanding(), 0);
    }

    #[test]
    fn reconfigure_fails() {
        let sched = started(Arc::new(SimDevice::new()), test_config());
        configure(&sched, 2, 4, true);
        let again = sched
            .configure(ConfigureCmd::new(4, 8, true, ExecMode::Software))
            .unwrap();
        assert_eq!(again.wait(WAIT), Some(CmdState::Error));
        assert_eq!(sched.stats().cus.len(), 2);
    }

    #[test]
    fn unconfigured_start_is_error() {
        let sched = started(Arc::new(SimDevice::new()), test_config());
        let client = sched.register_client();
        let handle = sched.submit(&client, start_cu(1)).unwrap();
        assert_eq!(handle.wait(WAIT), Some(CmdState::Error));
    }

    #[test]
    fn timestamps_follow_states() {
        let sched = started(Arc::new(SimDevice::new()), test_config());
        configure(&sched, 1, 4, true);
        let client = sched.register_client();
        let handle = sched.submit_with_timestamps(&client, start_cu(1)).unwrap();
        assert_eq!(handle.wait(WAIT), Some(CmdState::Completed));
        let stamps = handle.timestamps();
        let states: Vec<_> = stamps.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![CmdState::New, CmdState::Queued, CmdState::Running, CmdState::Completed]
        );
        assert!(stamps.windows(2).all(|w| w[0].1 <= w[1].1));

        let plain = sched.submit(&client, start_cu(1)).unwrap();
        plain.wait(WAIT);
        assert!(plain.timestamps().is_empty());
    }

    fn copy_cmd() -> Command {
        Command::CopyBo(CopyBoCmd {
            src_handle: 1,
            dst_handle: 2,
            size: 1 << 20,
            src_offset: 0,
            dst_offset: 64,
        })
    }

    #[test]
    fn copy_completion_wakes_scheduler() {
        let dev = Arc::new(SimDevice::new().with_copy_behavior(CopyBehavior::Manual));
        let sched = started(dev.clone(), test_config());
        configure(&sched, 1, 4, false);
        let client = sched.register_client();

        let ok = sched.submit(&client, copy_cmd()).unwrap();
        assert!(ok.wait_for(CmdState::Running, WAIT));
        assert_eq!(dev.finish_copies(true), 1);
        assert_eq!(ok.wait(WAIT), Some(CmdState::Completed));

        let failed = sched.submit(&client, copy_cmd()).unwrap();
        assert!(failed.wait_for(CmdState::Running, WAIT));
        dev.finish_copies(false);
        assert_eq!(failed.wait(WAIT), Some(CmdState::Error));
    }

    #[test]
    fn rejected_copy_is_error() {
        let dev = Arc::new(SimDevice::new().with_copy_behavior(CopyBehavior::Reject));
        let sched = started(dev, test_config());
        configure(&sched, 1, 4, true);
        let client = sched.register_client();
        let handle = sched.submit(&client, copy_cmd()).unwrap();
        assert_eq!(handle.wait(WAIT), Some(CmdState::Error));
        assert_eq!(sched.stats().free_slots, 4);
    }

    #[test]
    fn shutdown_aborts_in_flight() {
        let dev = Arc::new(SimDevice::manual());
        let sched = started(dev, test_config());
        configure(&sched, 1, 4, true);
        let client = sched.register_client();

        let running = sched.submit(&client, start_cu(1)).unwrap();
        assert!(running.wait_for(CmdState::Running, WAIT));
        let queued = sched.submit(&client, start_cu(1)).unwrap();
        assert!(wait_until(|| sched.stats().running == 2));

        sched.shutdown();
        assert_eq!(sched.lifecycle(), Lifecycle::Stopped);
        assert_eq!(running.wait(WAIT), Some(CmdState::Abort));
        assert_eq!(queued.wait(WAIT), Some(CmdState::Abort));
        assert_eq!(client.outstanding(), 0);
        assert_eq!(sched.pool_outstanding(), 0);
        assert_eq!(sched.submit(&client, start_cu(1)).unwrap_err(), SubmitError::Stopped);
        sched.shutdown();
    }

    #[test]
    fn idle_reset_returns_to_unconfigured() {
        let sched = started(Arc::new(SimDevice::new()), test_config());
        configure(&sched, 2, 4, true);
        assert!(sched.stats().configured);

        sched.reset().unwrap();
        let stats = sched.stats();
        assert!(!stats.configured);
        assert_eq!(stats.num_slots, 16);
        assert!(stats.cus.is_empty());
        assert_eq!(sched.exec_status(), ExecStatus::Normal);

        configure(&sched, 3, 8, true);
        assert_eq!(sched.stats().valid_cus(), 3);
    }

    #[test]
    fn busy_reset_is_refused() {
        let dev = Arc::new(SimDevice::manual());
        let sched = started(dev.clone(), test_config());
        configure(&sched, 1, 4, true);
        let client = sched.register_client();
        let handle = sched.submit(&client, start_cu(1)).unwrap();
        assert!(handle.wait_for(CmdState::Running, WAIT));

        assert_eq!(sched.reset(), Err(ResetError::Busy { pending: 0, running: 1 }));
        assert_eq!(sched.exec_status(), ExecStatus::Normal);
        assert!(sched.stats().configured);

        dev.complete(0);
        assert_eq!(handle.wait(WAIT), Some(CmdState::Completed));
    }

    #[test]
    fn flush_aborts_queued_jobs_without_cu() {
        let dev = Arc::new(SimDevice::manual());
        let sched = started(dev.clone(), test_config());
        configure(&sched, 1, 4, true);
        let client = sched.register_client();
        let running = sched.submit(&client, start_cu(1)).unwrap();
        assert!(running.wait_for(CmdState::Running, WAIT));
        let queued = sched.submit(&client, start_cu(1)).unwrap();
        assert!(wait_until(|| sched.stats().running == 2));

        assert!(matches!(sched.reset(), Err(ResetError::Busy { running: 1, .. })));
        assert_eq!(queued.wait(WAIT), Some(CmdState::Abort));
        assert_eq!(running.state(), CmdState::Running);
        dev.complete(0);
        assert_eq!(running.wait(WAIT), Some(CmdState::Completed));
    }

    #[test]
    fn pool_is_conserved() {
        let sched = started(Arc::new(SimDevice::new()), test_config());
        configure(&sched, 2, 4, true);
        let client = sched.register_client();
        let handles: Vec<_> = (0..20)
            .map(|_| sched.submit(&client, start_cu(0b11)).unwrap())
            .collect();
        for handle in &handles {
            assert_eq!(handle.wait(WAIT), Some(CmdState::Completed));
        }
        assert_eq!(sched.pool_outstanding(), 0);
        assert_eq!(sched.stats().retired.completed, 21);
        assert_eq!(client.events(), 20);
    }

    #[test]
    fn unregister_with_outstanding_aborts() {
        let dev = Arc::new(SimDevice::manual());
        let sched = started(dev, test_config());
        configure(&sched, 1, 4, true);
        let client = sched.register_client();
        let running = sched.submit(&client, start_cu(1)).unwrap();
        assert!(running.wait_for(CmdState::Running, WAIT));
        let queued = sched.submit(&client, start_cu(1)).unwrap();
        sched.unregister_client(client.id());
        assert_eq!(queued.wait(WAIT), Some(CmdState::Abort));
        assert!(client.is_aborted());
        assert!(matches!(
            sched.submit(&client, start_cu(1)),
            Err(SubmitError::ClientAborted(_))
        ));
    }

    #[test]
    fn soft_kernel_round_trip() {
        let dev = Arc::new(SimDevice::new());
        let sched = Scheduler::builder(test_config(), dev.clone())
            .embedded(dev)
            .start()
            .unwrap();
        let cfg = sched
            .configure(ConfigureCmd::new(1, 8, false, ExecMode::Embedded))
            .unwrap();
        assert_eq!(cfg.wait(WAIT), Some(CmdState::Completed));
        assert!(sched.stats().polling);

        // Worker manager: bring soft CUs up and tear them down on request.
        let soft = sched.soft_workers();
        let manager = thread::spawn(move || {
            let mut workers = Vec::new();
            while let Some(cmd) = soft.next_command(WAIT) {
                match cmd {
                    SoftCommand::Configure { start, num } => {
                        for idx in start..start + num {
                            let cu = soft.register(idx).unwrap();
                            let soft = Arc::clone(&soft);
                            workers.push(thread::spawn(move || loop {
                                match cu.wait_for_work(WAIT) {
                                    SoftWork::Start(_) => cu.mark_done(),
                                    SoftWork::Release | SoftWork::TimedOut => {
                                        soft.deregister(cu.index());
                                        break;
                                    }
                                }
                            }));
                        }
                    }
                    SoftCommand::Unconfigure { .. } => break,
                }
            }
            workers.into_iter().for_each(|w| w.join().unwrap());
        });

        let client = sched.register_client();
        let up = sched
            .submit(&client, Command::SkConfig(SkRangeCmd { start_cu: 0, num_cus: 2 }))
            .unwrap();
        assert_eq!(up.wait(WAIT), Some(CmdState::Completed));
        assert_eq!(sched.stats().soft_cus, 2);

        let run = sched
            .submit(
                &client,
                Command::SkStart(StartCuCmd { cu_mask: CuMask::from_word(0b11), regmap: vec![7] }),
            )
            .unwrap();
        assert_eq!(run.wait(WAIT), Some(CmdState::Completed));
        assert_eq!(run.cu(), Some(0));

        let down = sched
            .submit(&client, Command::SkUnconfig(SkRangeCmd { start_cu: 0, num_cus: 2 }))
            .unwrap();
        assert_eq!(down.wait(WAIT), Some(CmdState::Completed));
        manager.join().unwrap();
        assert_eq!(sched.stats().soft_cus, 0);
    }

    #[test]
    fn embedded_start_cu() {
        let dev = Arc::new(SimDevice::new());
        let sched = Scheduler::builder(test_config(), dev.clone())
            .embedded(dev)
            .start()
            .unwrap();
        let cfg = sched
            .configure(ConfigureCmd::new(2, 4, true, ExecMode::Embedded))
            .unwrap();
        assert_eq!(cfg.wait(WAIT), Some(CmdState::Completed));
        let client = sched.register_client();
        let handle = sched.submit(&client, start_cu(0b10)).unwrap();
        assert_eq!(handle.wait(WAIT), Some(CmdState::Completed));
    }

    #[test]
    fn submit_racing_shutdown_is_refused() {
        let sched = started(Arc::new(SimDevice::new()), test_config());
        configure(&sched, 1, 4, true);
        let client = sched.register_client();

        // Stop reaches the wake path before the lifecycle flips.
        sched.shared.signal.stop();
        assert_eq!(sched.lifecycle(), Lifecycle::Running);
        assert_eq!(sched.submit(&client, start_cu(1)).unwrap_err(), SubmitError::Stopped);
        assert_eq!(client.outstanding(), 0);
        assert_eq!(sched.pool_outstanding(), 0);
        sched.shutdown();
    }

    #[test]
    fn interrupt_mode_ignores_unsignalled_completion() {
        let dev = Arc::new(SimDevice::manual());
        let sched = started(dev.clone(), test_config());
        configure(&sched, 2, 4, false);
        let client = sched.register_client();

        let a = sched.submit(&client, start_cu(0b01)).unwrap();
        assert!(a.wait_for(CmdState::Running, WAIT));
        dev.complete(0);

        // Another submission wakes the scheduler, but CU 0 never interrupted.
        let b = sched.submit(&client, start_cu(0b10)).unwrap();
        assert!(b.wait_for(CmdState::Running, WAIT));
        assert_eq!(a.wait(Duration::from_millis(20)), None);
        assert_eq!(a.state(), CmdState::Running);

        sched.cu_interrupt(0);
        assert_eq!(a.wait(WAIT), Some(CmdState::Completed));
        assert_eq!(b.state(), CmdState::Running);
        dev.complete(1);
        sched.cu_interrupt(1);
        assert_eq!(b.wait(WAIT), Some(CmdState::Completed));
    }

    #[test]
    fn soft_start_fails_when_its_cu_is_unconfigured() {
        let dev = Arc::new(SimDevice::new());
        let sched = Scheduler::builder(test_config(), dev.clone())
            .embedded(dev)
            .start()
            .unwrap();
        let cfg = sched
            .configure(ConfigureCmd::new(1, 8, false, ExecMode::Embedded))
            .unwrap();
        assert_eq!(cfg.wait(WAIT), Some(CmdState::Completed));
        let soft = sched.soft_workers();
        let client = sched.register_client();
        let range = SkRangeCmd { start_cu: 0, num_cus: 1 };

        let up = sched.submit(&client, Command::SkConfig(range)).unwrap();
        assert!(matches!(soft.next_command(WAIT), Some(SoftCommand::Configure { start: 0, num: 1 })));
        let cu = soft.register(0).unwrap();
        assert_eq!(up.wait(WAIT), Some(CmdState::Completed));

        // A worker that takes the start and never reports done.
        let stuck = {
            let soft = Arc::clone(&soft);
            thread::spawn(move || {
                while let SoftWork::Start(_) = cu.wait_for_work(WAIT) {}
                soft.deregister(cu.index());
            })
        };
        let start = Command::SkStart(StartCuCmd { cu_mask: CuMask::from_word(1), regmap: vec![] });
        let orphan = sched.submit(&client, start.clone()).unwrap();
        assert!(orphan.wait_for(CmdState::Running, WAIT));
        assert_eq!(orphan.cu(), Some(0));

        let down = sched.submit(&client, Command::SkUnconfig(range)).unwrap();
        assert_eq!(down.wait(WAIT), Some(CmdState::Completed));
        assert_eq!(orphan.wait(WAIT), Some(CmdState::Error));
        stuck.join().unwrap();
        assert!(wait_until(|| sched.stats().running == 0));
        assert_eq!(client.outstanding(), 0);

        // The soft CU went back to the pool with the failed job.
        let up = sched.submit(&client, Command::SkConfig(range)).unwrap();
        assert!(matches!(soft.next_command(WAIT), Some(SoftCommand::Unconfigure { .. })));
        assert!(matches!(soft.next_command(WAIT), Some(SoftCommand::Configure { start: 0, num: 1 })));
        let cu = soft.register(0).unwrap();
        assert_eq!(up.wait(WAIT), Some(CmdState::Completed));
        let worker = thread::spawn(move || {
            if let SoftWork::Start(_) = cu.wait_for_work(WAIT) {
                cu.mark_done();
            }
        });
        let again = sched.submit(&client, start).unwrap();
        assert_eq!(again.wait(WAIT), Some(CmdState::Completed));
        worker.join().unwrap();
    }
}
