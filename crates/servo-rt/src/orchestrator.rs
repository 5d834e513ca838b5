//! Bank-level orchestration of periodic tasks.
//!
//! The orchestrator owns an ordered bank of `RealtimeTask`s (fastest period
//! first, a documented precondition of the control design) and one
//! best-effort telemetry poller thread. It is the only component that issues
//! lifecycle commands to the bank as a unit, and the only place that decides
//! between the graceful stop path and the emergency stop path.
//!
//! The poller runs at normal OS priority and only ever reads telemetry
//! snapshots; delaying or preempting it has no effect on control
//! correctness.

use crate::faultlog::FaultLog;
use crate::interlock::EmergencyInterlock;
use crate::rt;
use crate::task::{RealtimeTask, TaskState};
use servo_common::error::{ServoError, ServoResult};
use servo_common::telemetry::{TaskTelemetry, TelemetrySnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One task's telemetry as seen by the presentation layer.
#[derive(Debug, Clone)]
pub struct TaskReading {
    /// Task name.
    pub name: String,
    /// Nominal period in seconds.
    pub nominal_period: f64,
    /// Timing snapshot at poll time.
    pub snapshot: TelemetrySnapshot,
}

/// Presentation-layer sink the telemetry poller publishes into.
///
/// Implementations are consoles, graph buffers, or test probes. Called from
/// the poller thread only.
pub trait TelemetrySink: Send + 'static {
    /// Receive one round of readings, one per task in bank order.
    fn publish(&mut self, readings: &[TaskReading]);

    /// Discard accumulated presentation data after a bank reset.
    fn clear(&mut self) {}
}

/// Best-effort polling thread reading task telemetry into a sink.
struct TelemetryPoller {
    shutdown: Arc<AtomicBool>,
    clear_pending: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TelemetryPoller {
    fn spawn(
        channels: Vec<(String, f64, Arc<TaskTelemetry>)>,
        interval: Duration,
        mut sink: Box<dyn TelemetrySink>,
    ) -> ServoResult<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let clear_pending = Arc::new(AtomicBool::new(false));

        let thread_shutdown = Arc::clone(&shutdown);
        let thread_clear = Arc::clone(&clear_pending);
        let handle = std::thread::Builder::new()
            .name("servo-telemetry".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "telemetry poller started");
                while !thread_shutdown.load(Ordering::Acquire) {
                    if thread_clear.swap(false, Ordering::AcqRel) {
                        sink.clear();
                    }
                    let readings: Vec<TaskReading> = channels
                        .iter()
                        .map(|(name, nominal, telemetry)| TaskReading {
                            name: name.clone(),
                            nominal_period: *nominal,
                            snapshot: telemetry.snapshot(),
                        })
                        .collect();
                    sink.publish(&readings);
                    std::thread::sleep(interval);
                }
                debug!("telemetry poller stopped");
            })
            .map_err(|e| ServoError::Os(format!("failed to spawn telemetry poller: {e}")))?;

        Ok(Self {
            shutdown,
            clear_pending,
            handle: Some(handle),
        })
    }

    fn request_clear(&self) {
        self.clear_pending.store(true, Ordering::Release);
    }

    fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TelemetryPoller {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Orchestrates a fixed bank of periodic tasks as a single unit.
pub struct TaskOrchestrator {
    tasks: Vec<RealtimeTask>,
    interlock: Arc<EmergencyInterlock>,
    poller: Option<TelemetryPoller>,
    fault_log: Option<Arc<FaultLog>>,
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("tasks", &self.tasks.len())
            .field("poller", &self.poller.is_some())
            .finish_non_exhaustive()
    }
}

impl TaskOrchestrator {
    /// Take ownership of an ordered task bank.
    ///
    /// The bank is expected fastest-period-first; an out-of-order bank is
    /// accepted with a warning since the ordering is a documented
    /// precondition of the control design, not an enforced invariant.
    ///
    /// # Errors
    ///
    /// Returns `ServoError::Config` for an empty bank.
    pub fn new(tasks: Vec<RealtimeTask>, interlock: Arc<EmergencyInterlock>) -> ServoResult<Self> {
        if tasks.is_empty() {
            return Err(ServoError::Config("task bank is empty".to_string()));
        }
        for pair in tasks.windows(2) {
            if pair[1].period().as_ns() < pair[0].period().as_ns() {
                warn!(
                    slower = %pair[0].name(),
                    faster = %pair[1].name(),
                    "task bank is not ordered fastest-period-first"
                );
            }
        }
        info!(tasks = tasks.len(), "task bank assembled");
        Ok(Self {
            tasks,
            interlock,
            poller: None,
            fault_log: None,
        })
    }

    /// Attach the append-only fault log; bank lifecycle transitions are
    /// recorded there alongside interlock trips.
    pub fn set_fault_log(&mut self, log: Arc<FaultLog>) {
        self.fault_log = Some(log);
    }

    fn log_transition(&self, msg: &str) {
        if let Some(log) = &self.fault_log {
            log.append(rt::current_cpu(), file!(), line!(), msg);
        }
    }

    /// Attach the telemetry poller thread.
    ///
    /// # Errors
    ///
    /// Returns `ServoError::Os` if the poller thread cannot be created.
    pub fn attach_poller(
        &mut self,
        interval: Duration,
        sink: Box<dyn TelemetrySink>,
    ) -> ServoResult<()> {
        let channels = self
            .tasks
            .iter()
            .map(|t| {
                (
                    t.name().to_string(),
                    t.period().as_secs_f64(),
                    t.telemetry_handle(),
                )
            })
            .collect();
        self.poller = Some(TelemetryPoller::spawn(channels, interval, sink)?);
        Ok(())
    }

    /// Tasks in bank order.
    #[must_use]
    pub fn tasks(&self) -> &[RealtimeTask] {
        &self.tasks
    }

    /// The interlock shared with the bank's control code.
    #[must_use]
    pub fn interlock(&self) -> &Arc<EmergencyInterlock> {
        &self.interlock
    }

    /// Start every task in bank order.
    ///
    /// Sequential start-and-confirm, one task at a time, so the affinity
    /// and priority setup of one task never races another's. Switches the
    /// interlock to realtime mode only after the whole bank has confirmed
    /// RUNNING.
    pub fn start_all(&self) {
        info!(tasks = self.tasks.len(), "starting task bank");
        for task in &self.tasks {
            task.start();
            task.wait_until_running();
            debug!(task = %task.name(), "confirmed RUNNING");
        }
        self.interlock.set_realtime_mode(true);
        self.log_transition("bank RUNNING");
        info!("task bank running");
    }

    /// Stop the whole bank.
    ///
    /// Normal path: leave realtime mode first so any invariant failure
    /// during shutdown fails fast instead of freezing, then stop and
    /// confirm each task in bank order.
    ///
    /// Emergency path (an emergency was declared this session): realtime
    /// mode must stay on until every frozen `check` caller is released, so
    /// the mode switch is skipped; stop requests are issued without waiting
    /// for confirmation (a frozen cyclic thread never confirms), and
    /// `declare_handled` then releases the frozen callers.
    pub fn stop_all(&self) {
        if self.interlock.is_emergency() {
            warn!("stopping task bank on the emergency path");
            for task in &self.tasks {
                task.stop();
            }
            self.interlock.declare_handled();
            self.log_transition("bank STOPPED (emergency)");
        } else {
            info!("stopping task bank");
            self.interlock.set_realtime_mode(false);
            for task in &self.tasks {
                task.stop();
                task.wait_until_stopped();
                debug!(task = %task.name(), "confirmed STOPPED");
            }
            self.log_transition("bank STOPPED");
        }
        info!("task bank stopped");
    }

    /// Reset telemetry accumulators across the bank and arm a fresh
    /// control session.
    ///
    /// # Errors
    ///
    /// Returns `ServoError::InvalidStateTransition` unless every task is
    /// STOPPED.
    pub fn reset_all(&self) -> ServoResult<()> {
        for task in &self.tasks {
            let state = task.state();
            if state != TaskState::Stopped {
                return Err(ServoError::InvalidStateTransition {
                    from: state.to_string(),
                    to: "RESET".to_string(),
                });
            }
        }
        for task in &self.tasks {
            task.reset()?;
        }
        if let Some(poller) = &self.poller {
            poller.request_clear();
        }
        self.interlock.arm();
        self.log_transition("bank RESET");
        info!("task bank reset, fresh session armed");
        Ok(())
    }

    /// Read-only telemetry query for consoles and graphs.
    #[must_use]
    pub fn readings(&self) -> Vec<TaskReading> {
        self.tasks
            .iter()
            .map(|t| TaskReading {
                name: t.name().to_string(),
                nominal_period: t.period().as_secs_f64(),
                snapshot: t.telemetry(),
            })
            .collect()
    }

    /// Tear the bank down.
    ///
    /// Graceful join per task normally; after an emergency the frozen
    /// threads cannot be joined, so each task is force-destroyed instead.
    pub fn destroy(mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        let emergency = self.interlock.is_emergency();
        if emergency {
            warn!("destroying task bank after an emergency");
        } else {
            info!("destroying task bank");
        }
        self.log_transition("bank DESTROYING");
        for task in self.tasks.drain(..) {
            if emergency {
                task.force_destroy();
            } else {
                task.destroy();
            }
        }
    }
}
