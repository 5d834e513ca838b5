//! Multi-rate bank timing and lifecycle acceptance tests.

use crate::acceptance::common::{
    counting_task, period_tolerance, relative_error, stop_deadline, test_interlock,
};
use servo_rt::orchestrator::TaskOrchestrator;
use servo_rt::task::TaskState;
use std::sync::Arc;
use std::time::{Duration, Instant};

const FAST_PERIOD: Duration = Duration::from_micros(100);
const SLOW_PERIOD: Duration = Duration::from_millis(1);

// The bank pins to cores 0 and 1
const BANK_CORES: usize = 2;

fn two_rate_bank() -> TaskOrchestrator {
    let bank = vec![
        counting_task("current-loop", FAST_PERIOD, 0),
        counting_task("position-loop", SLOW_PERIOD, 1),
    ];
    TaskOrchestrator::new(bank, test_interlock()).unwrap()
}

#[test]
fn test_two_rate_bank_timing_and_reset() {
    let orch = two_rate_bank();

    orch.start_all();
    assert!(orch.interlock().is_realtime_mode());
    std::thread::sleep(Duration::from_millis(50));

    let tolerance = period_tolerance(BANK_CORES);
    for reading in orch.readings() {
        let snap = &reading.snapshot;
        assert!(
            snap.measured_period > 0.0,
            "{} never published a measured period",
            reading.name
        );
        let error = relative_error(snap.measured_period, reading.nominal_period);
        assert!(
            error <= tolerance,
            "{}: measured period {:.1}us deviates {:.0}% from nominal {:.1}us",
            reading.name,
            snap.measured_period * 1e6,
            error * 100.0,
            reading.nominal_period * 1e6
        );
        assert!(snap.running_max_period >= snap.running_min_period);
        assert!(snap.current_time >= 0.04);
    }

    // Graceful stop must complete within a bounded number of slow periods
    let stop_start = Instant::now();
    orch.stop_all();
    assert!(
        stop_start.elapsed() <= stop_deadline(SLOW_PERIOD, BANK_CORES),
        "stop_all took {:?}",
        stop_start.elapsed()
    );
    assert!(!orch.interlock().is_realtime_mode());

    // Reset restores both running extrema to the nominal period
    orch.reset_all().unwrap();
    for reading in orch.readings() {
        assert_eq!(reading.snapshot.running_max_period, reading.nominal_period);
        assert_eq!(reading.snapshot.running_min_period, reading.nominal_period);
        assert_eq!(reading.snapshot.current_time, 0.0);
    }

    orch.destroy();
}

#[test]
fn test_bank_restart_cycle() {
    let orch = two_rate_bank();

    for _ in 0..3 {
        orch.start_all();
        for task in orch.tasks() {
            assert_eq!(task.state(), TaskState::Running);
        }
        std::thread::sleep(Duration::from_millis(10));
        orch.stop_all();
        for task in orch.tasks() {
            assert_eq!(task.state(), TaskState::Stopped);
        }
        orch.reset_all().unwrap();
    }

    orch.destroy();
}

#[test]
fn test_extrema_monotonic_across_bank() {
    let orch = two_rate_bank();
    orch.start_all();

    let mut prev: Vec<(f64, f64)> = orch
        .readings()
        .iter()
        .map(|r| (r.snapshot.running_max_period, r.snapshot.running_min_period))
        .collect();

    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(10));
        let current: Vec<(f64, f64)> = orch
            .readings()
            .iter()
            .map(|r| (r.snapshot.running_max_period, r.snapshot.running_min_period))
            .collect();
        for ((max, min), (prev_max, prev_min)) in current.iter().zip(&prev) {
            assert!(max >= prev_max, "running max shrank");
            assert!(min <= prev_min, "running min grew");
        }
        prev = current;
    }

    orch.stop_all();
    orch.destroy();
}

#[test]
fn test_start_all_confirms_every_task_ran() {
    use servo_common::clock::Period;
    use servo_common::config::WaitStrategy;
    use servo_rt::task::RealtimeTask;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let counters: Vec<Arc<AtomicUsize>> = (0..2).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let mut bank = Vec::new();
    for (i, counter) in counters.iter().enumerate() {
        let task = RealtimeTask::new(
            &format!("loop-{i}"),
            Period::from_duration(Duration::from_millis(1)).unwrap(),
            i,
            WaitStrategy::InsertIdleGap,
        )
        .unwrap();
        let counter = Arc::clone(counter);
        task.set_cycle_fn(Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::Relaxed);
            true
        }))
        .unwrap();
        bank.push(task);
    }

    let orch = TaskOrchestrator::new(bank, test_interlock()).unwrap();
    orch.start_all();
    // start_all returns only after every task confirmed RUNNING, and a task
    // confirms only after its first executed cycle
    for counter in &counters {
        assert!(counter.load(Ordering::Relaxed) >= 1);
    }

    orch.stop_all();
    orch.destroy();
}
