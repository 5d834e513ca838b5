//! Emergency interlock acceptance tests under a live task bank.

use crate::acceptance::common::{counting_task, test_interlock};
use servo_common::clock::Period;
use servo_common::config::WaitStrategy;
use servo_rt::faultlog::FaultLog;
use servo_rt::interlock::EmergencyInterlock;
use servo_rt::orchestrator::TaskOrchestrator;
use servo_rt::task::{RealtimeTask, TaskState};
use servo_rt::verify;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Task whose cycle function trips the interlock on its fiftieth cycle,
/// about 50ms in, comfortably after `start_all` has confirmed the bank
/// and switched the interlock to realtime mode.
fn tripping_task(interlock: Arc<EmergencyInterlock>) -> RealtimeTask {
    let task = RealtimeTask::new(
        "tripping-loop",
        Period::from_duration(Duration::from_millis(1)).unwrap(),
        0,
        WaitStrategy::InsertIdleGap,
    )
    .unwrap();
    let mut cycles = 0_u32;
    task.set_cycle_fn(Box::new(move |_, _, _| {
        cycles += 1;
        verify!(interlock, cycles < 50);
        true
    }))
    .unwrap();
    task
}

#[test]
fn test_emergency_from_cycle_function() {
    let interlock = test_interlock();
    let bank = vec![
        tripping_task(Arc::clone(&interlock)),
        counting_task("healthy-loop", Duration::from_millis(1), 1),
    ];
    let orch = TaskOrchestrator::new(bank, Arc::clone(&interlock)).unwrap();

    orch.start_all();
    assert!(interlock.is_realtime_mode());

    // The fiftieth cycle of the tripping task declares the emergency
    assert!(interlock.wait_for_emergency_timeout(Duration::from_secs(2)));
    let site = interlock.failure_site().unwrap();
    assert_eq!(site.condition, "cycles < 50");
    assert!(site.file.ends_with("interlock_test.rs"));

    // Emergency stop must not wait on the frozen task, so it returns
    // quickly even though that thread never confirms STOPPED
    let stop_start = Instant::now();
    orch.stop_all();
    assert!(stop_start.elapsed() < Duration::from_secs(1));
    assert!(interlock.is_handled());
    // Realtime mode stays on through the emergency path
    assert!(interlock.is_realtime_mode());

    // The frozen thread is alive and still reports its last confirmed state
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(orch.tasks()[0].state(), TaskState::Running);
    // The healthy task observed the stop request normally
    orch.tasks()[1].wait_until_stopped();
    assert_eq!(orch.tasks()[1].state(), TaskState::Stopped);

    // Teardown detaches the frozen thread after a bounded wait
    drop(orch);
}

#[test]
fn test_emergency_trip_appends_to_fault_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("faults.log");

    let mut interlock = EmergencyInterlock::with_fail_hook(Box::new(|_| {}));
    interlock.set_fault_log(Arc::new(FaultLog::open(&path).unwrap()));
    let interlock = Arc::new(interlock);

    let bank = vec![tripping_task(Arc::clone(&interlock))];
    let orch = TaskOrchestrator::new(bank, Arc::clone(&interlock)).unwrap();

    orch.start_all();
    assert!(interlock.wait_for_emergency_timeout(Duration::from_secs(2)));
    orch.stop_all();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 1, "single-fire: exactly one entry");
    assert!(content.contains("msg=cycles < 50"));
    assert!(content.contains("cpu="));

    drop(orch);
}

#[test]
fn test_emergency_is_single_fire_across_bank() {
    let interlock = test_interlock();
    // Two tasks tripping concurrently on different conditions
    let first = tripping_task(Arc::clone(&interlock));
    let second = RealtimeTask::new(
        "second-tripping",
        Period::from_duration(Duration::from_millis(1)).unwrap(),
        1,
        WaitStrategy::InsertIdleGap,
    )
    .unwrap();
    let second_interlock = Arc::clone(&interlock);
    let mut cycles = 0_u32;
    second
        .set_cycle_fn(Box::new(move |_, _, _| {
            cycles += 1;
            verify!(second_interlock, cycles < 50);
            true
        }))
        .unwrap();

    let orch = TaskOrchestrator::new(vec![first, second], Arc::clone(&interlock)).unwrap();
    orch.start_all();
    assert!(interlock.wait_for_emergency_timeout(Duration::from_secs(2)));

    // Whichever tripped first owns the recorded site; later failures are
    // no-ops on the record
    std::thread::sleep(Duration::from_millis(100));
    let site = interlock.failure_site().unwrap();
    assert_eq!(site.condition, "cycles < 50");

    orch.stop_all();
    drop(orch);
}

/// Child half of the fail-fast test. Only runs when re-executed by
/// `test_nonrealtime_failure_exits_process`; the default interlock's
/// non-realtime branch terminates the process with status 1.
#[test]
fn fail_fast_child() {
    if std::env::var("SERVO_FAIL_FAST_CHILD").is_err() {
        return;
    }
    let interlock = EmergencyInterlock::new();
    interlock.check(false, "x > 0", "f.rs", 42);
    unreachable!("non-realtime check(false) must not return");
}

#[test]
fn test_nonrealtime_failure_exits_process() {
    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args([
            "acceptance::interlock_test::fail_fast_child",
            "--exact",
            "--nocapture",
            "--test-threads",
            "1",
        ])
        .env("SERVO_FAIL_FAST_CHILD", "1")
        .output()
        .unwrap();

    assert!(
        !output.status.success(),
        "child process should have died with a non-zero status"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("x > 0"), "diagnostic missing: {stderr}");
}
