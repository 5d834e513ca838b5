//! One control session: bank construction, supervision, teardown.
//!
//! The daemon's cycle functions are demo command generators standing in for
//! application control code; real deployments install their own functions
//! through the library API. The supervision loop here is the "supervisor"
//! the interlock contract refers to: it waits for either an emergency, an
//! operator signal, or the configured run duration, and chooses the stop
//! path accordingly.

use anyhow::{Context, Result};
use servo_common::clock::Period;
use servo_common::config::KernelConfig;
use servo_rt::faultlog::FaultLog;
use servo_rt::interlock::EmergencyInterlock;
use servo_rt::orchestrator::{TaskOrchestrator, TaskReading, TelemetrySink};
use servo_rt::task::RealtimeTask;
use servo_rt::verify;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::signals::SignalHandler;

/// How often the supervision loop polls for an emergency between checks of
/// the shutdown flag and run duration.
const SUPERVISION_INTERVAL: Duration = Duration::from_millis(100);

/// Demo command generator: a 1 Hz sine position setpoint.
const DEMO_COMMAND_HZ: f64 = 1.0;

/// Telemetry sink that reports per-task timing through `tracing`.
struct ConsoleSink;

impl TelemetrySink for ConsoleSink {
    fn publish(&mut self, readings: &[TaskReading]) {
        for r in readings {
            debug!(
                task = %r.name,
                period_us = r.snapshot.measured_period * 1e6,
                consumed_us = r.snapshot.consumed_time * 1e6,
                jitter_us = r.snapshot.jitter() * 1e6,
                "telemetry"
            );
        }
    }

    fn clear(&mut self) {
        debug!("telemetry cleared");
    }
}

/// Build the task bank and orchestrator from a validated configuration.
pub fn build_session(
    config: &KernelConfig,
    interlock: Arc<EmergencyInterlock>,
) -> Result<TaskOrchestrator> {
    let mut tasks = Vec::with_capacity(config.tasks.len());
    for task_cfg in &config.tasks {
        let period = Period::from_duration(task_cfg.period)
            .with_context(|| format!("task '{}' has an invalid period", task_cfg.name))?;
        let task = RealtimeTask::new(&task_cfg.name, period, task_cfg.cpu, task_cfg.wait_strategy)
            .with_context(|| format!("failed to create task '{}'", task_cfg.name))?;
        install_demo_cycle_fn(&task, Arc::clone(&interlock))?;
        tasks.push(task);
    }

    let mut orchestrator = TaskOrchestrator::new(tasks, interlock)
        .context("failed to assemble the task bank")?;
    if config.telemetry.enabled {
        orchestrator
            .attach_poller(config.telemetry.poll_interval, Box::new(ConsoleSink))
            .context("failed to start the telemetry poller")?;
    }
    Ok(orchestrator)
}

/// Install the demo sine command generator, guarded by runtime invariants.
fn install_demo_cycle_fn(task: &RealtimeTask, interlock: Arc<EmergencyInterlock>) -> Result<()> {
    task.set_cycle_fn(Box::new(move |elapsed, measured, consumed| {
        let command = (2.0 * std::f64::consts::PI * DEMO_COMMAND_HZ * elapsed).sin();
        verify!(interlock, command.is_finite());
        verify!(interlock, measured >= 0.0);
        verify!(interlock, consumed >= 0.0);
        true
    }))
    .map_err(|e| anyhow::anyhow!("failed to install cycle function: {e}"))
}

/// Open the fault log configured for this session, if any.
pub fn open_fault_log(config: &KernelConfig) -> Result<Option<Arc<FaultLog>>> {
    match &config.fault_log {
        Some(path) => {
            let log = FaultLog::open(path)
                .with_context(|| format!("failed to open fault log {path:?}"))?;
            info!(path = ?path, "fault log opened");
            Ok(Some(Arc::new(log)))
        }
        None => Ok(None),
    }
}

/// Run one control session to completion.
///
/// Returns an error if the session ended on the emergency path.
pub fn run_session(
    orchestrator: &TaskOrchestrator,
    handler: &SignalHandler,
    duration: Option<Duration>,
) -> Result<()> {
    orchestrator.start_all();
    let started = Instant::now();
    let interlock = orchestrator.interlock();

    let emergency = loop {
        if interlock.wait_for_emergency_timeout(SUPERVISION_INTERVAL) {
            break true;
        }
        if handler.shutdown_requested() {
            info!("shutdown requested, stopping the session");
            break false;
        }
        if let Some(limit) = duration {
            if started.elapsed() >= limit {
                info!(seconds = limit.as_secs_f64(), "run duration reached");
                break false;
            }
        }
    };

    if emergency {
        if let Some(site) = interlock.failure_site() {
            error!(
                condition = %site.condition,
                file = %site.file,
                line = site.line,
                "emergency declared, stopping the session on the emergency path"
            );
        }
        orchestrator.stop_all();
        anyhow::bail!("session ended on the emergency path");
    }

    orchestrator.stop_all();
    log_final_statistics(orchestrator);
    Ok(())
}

/// Per-task timing summary at the end of a session.
fn log_final_statistics(orchestrator: &TaskOrchestrator) {
    for r in orchestrator.readings() {
        let nominal_us = r.nominal_period * 1e6;
        let snap = &r.snapshot;
        info!(
            task = %r.name,
            nominal_us,
            measured_us = snap.measured_period * 1e6,
            consumed_us = snap.consumed_time * 1e6,
            max_us = snap.running_max_period * 1e6,
            min_us = snap.running_min_period * 1e6,
            jitter_us = snap.jitter() * 1e6,
            run_s = snap.current_time,
            "final task statistics"
        );
        if snap.running_max_period > 2.0 * r.nominal_period {
            warn!(task = %r.name, "worst-case period exceeded twice the nominal");
        }
    }
}
