//! Periodic real-time task engine.
//!
//! One `RealtimeTask` owns exactly one OS thread for its whole lifetime:
//! the thread is created at construction, pins itself to the configured CPU
//! core under SCHED_FIFO at maximum priority, and cycles between IDLE and
//! RUNNING until DESTROYING is observed. While RUNNING it executes the
//! installed cycle function once per period and busy-polls the monotonic
//! clock for the next tick; it never blocks on a mutex or condition
//! variable inside the hot loop. All blocking waits (`wait_until_running`,
//! `wait_until_stopped`) happen on the control side, against transitional
//! states only.
//!
//! Overruns slip the whole schedule rather than dropping cycles: the next
//! tick is always `start_time + period`, and a poll that is already past
//! its tick re-enters immediately.

use crate::rt;
use servo_common::clock::{ns_to_secs, MonotonicClock, Period};
use servo_common::config::WaitStrategy;
use servo_common::error::{ServoError, ServoResult};
use servo_common::telemetry::{TaskTelemetry, TelemetrySnapshot};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long `Drop` waits for the backing thread to confirm DESTROYING
/// before detaching it. A thread frozen inside an emergency check never
/// confirms.
const DROP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle states of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Backing thread parked, no session ever run.
    Idle = 0,
    /// Start requested, first cycle not yet complete.
    Starting = 1,
    /// Cyclic loop executing.
    Running = 2,
    /// Stop requested, loop exiting.
    Stopping = 3,
    /// Session ended, backing thread parked again.
    Stopped = 4,
    /// Backing thread exiting for good.
    Destroying = 5,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            5 => Self::Destroying,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Destroying => write!(f, "DESTROYING"),
        }
    }
}

/// Cyclic control function: `(elapsed_s, measured_period_s, consumed_s)`.
///
/// Returning `true` means "wait for the next scheduled tick"; `false` means
/// "skip the wait and re-enter immediately" (used to fast-forward through a
/// degenerate condition without blocking).
pub type CycleFn = Box<dyn FnMut(f64, f64, f64) -> bool + Send>;

/// State shared between the control side and the backing thread.
struct TaskShared {
    /// Requested lifecycle state, read by the hot loop with plain loads.
    request: AtomicU8,
    /// Confirmed lifecycle state, updated only at transitions.
    lifecycle: Mutex<TaskState>,
    lifecycle_cv: Condvar,
}

impl TaskShared {
    fn request_state(&self) -> TaskState {
        TaskState::from_u8(self.request.load(Ordering::Acquire))
    }

    /// Confirm a lifecycle state and wake all waiters.
    fn confirm(&self, state: TaskState) {
        let mut st = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        *st = state;
        self.lifecycle_cv.notify_all();
    }
}

/// One periodic real-time task pinned to one CPU core.
pub struct RealtimeTask {
    name: String,
    period: Period,
    cpu: usize,
    shared: Arc<TaskShared>,
    telemetry: Arc<TaskTelemetry>,
    cycle_slot: Arc<Mutex<Option<CycleFn>>>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RealtimeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeTask")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("cpu", &self.cpu)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RealtimeTask {
    /// Create a task and its backing thread.
    ///
    /// The thread pins itself to `cpu`, requests SCHED_FIFO at maximum
    /// priority, applies the wait-strategy OS tunables, and parks in IDLE.
    /// EPERM on the scheduling calls degrades to a warning so unprivileged
    /// hosts can still run.
    ///
    /// # Errors
    ///
    /// Returns `ServoError::Os` if the thread cannot be created.
    pub fn new(
        name: &str,
        period: Period,
        cpu: usize,
        strategy: WaitStrategy,
    ) -> ServoResult<Self> {
        let shared = Arc::new(TaskShared {
            request: AtomicU8::new(TaskState::Idle as u8),
            lifecycle: Mutex::new(TaskState::Idle),
            lifecycle_cv: Condvar::new(),
        });
        let telemetry = Arc::new(TaskTelemetry::new(period.as_secs_f64()));
        let cycle_slot: Arc<Mutex<Option<CycleFn>>> = Arc::new(Mutex::new(None));

        let thread_shared = Arc::clone(&shared);
        let thread_telemetry = Arc::clone(&telemetry);
        let thread_slot = Arc::clone(&cycle_slot);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("servo-rt-{name}"))
            .spawn(move || {
                thread_main(
                    &thread_shared,
                    &thread_telemetry,
                    &thread_slot,
                    period,
                    cpu,
                    strategy,
                    &thread_name,
                );
            })
            .map_err(|e| ServoError::Os(format!("failed to spawn task thread: {e}")))?;

        info!(
            task = name,
            period_ns = period.as_ns(),
            cpu,
            ?strategy,
            "real-time task created"
        );

        Ok(Self {
            name: name.to_string(),
            period,
            cpu,
            shared,
            telemetry,
            cycle_slot,
            handle: Some(handle),
        })
    }

    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nominal sampling period.
    #[must_use]
    pub fn period(&self) -> Period {
        self.period
    }

    /// CPU core the backing thread is pinned to.
    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Confirmed lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.shared.lifecycle.lock().expect("lifecycle mutex poisoned")
    }

    /// Install the cycle function.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is STARTING or RUNNING; the function
    /// may only be installed while the backing thread is parked.
    pub fn set_cycle_fn(&self, f: CycleFn) -> ServoResult<()> {
        let st = self.shared.lifecycle.lock().expect("lifecycle mutex poisoned");
        if matches!(*st, TaskState::Starting | TaskState::Running)
            || self.shared.request_state() == TaskState::Starting
        {
            return Err(ServoError::Fault(format!(
                "task '{}' is {}; cycle function can only be installed while parked",
                self.name, *st
            )));
        }
        drop(st);
        *self.cycle_slot.lock().expect("cycle slot mutex poisoned") = Some(f);
        Ok(())
    }

    /// Request the task to start. Non-blocking; a no-op while already
    /// STARTING or RUNNING.
    pub fn start(&self) {
        let st = self.shared.lifecycle.lock().expect("lifecycle mutex poisoned");
        if matches!(*st, TaskState::Starting | TaskState::Running | TaskState::Destroying) {
            return;
        }
        self.shared
            .request
            .store(TaskState::Starting as u8, Ordering::Release);
        self.shared.lifecycle_cv.notify_all();
        drop(st);
        debug!(task = %self.name, "start requested");
    }

    /// Block until the backing thread confirms RUNNING.
    ///
    /// The thread confirms only after it has executed at least one full
    /// cycle, so telemetry is valid when this returns.
    pub fn wait_until_running(&self) {
        let mut st = self.shared.lifecycle.lock().expect("lifecycle mutex poisoned");
        while !matches!(*st, TaskState::Running | TaskState::Destroying) {
            st = self
                .shared
                .lifecycle_cv
                .wait(st)
                .expect("lifecycle mutex poisoned");
        }
    }

    /// Request the task to stop. Non-blocking; a no-op while not running.
    pub fn stop(&self) {
        let st = self.shared.lifecycle.lock().expect("lifecycle mutex poisoned");
        let starting_requested = self.shared.request_state() == TaskState::Starting;
        if !matches!(*st, TaskState::Starting | TaskState::Running) && !starting_requested {
            return;
        }
        self.shared
            .request
            .store(TaskState::Stopping as u8, Ordering::Release);
        self.shared.lifecycle_cv.notify_all();
        drop(st);
        debug!(task = %self.name, "stop requested");
    }

    /// Block until the backing thread has left the cyclic loop.
    pub fn wait_until_stopped(&self) {
        let mut st = self.shared.lifecycle.lock().expect("lifecycle mutex poisoned");
        while matches!(*st, TaskState::Starting | TaskState::Running) {
            st = self
                .shared
                .lifecycle_cv
                .wait(st)
                .expect("lifecycle mutex poisoned");
        }
    }

    /// Clear the telemetry accumulators: running extrema back to the
    /// nominal period, measured state to zero.
    ///
    /// # Errors
    ///
    /// Returns an error unless the task is STOPPED.
    pub fn reset(&self) -> ServoResult<()> {
        let st = self.shared.lifecycle.lock().expect("lifecycle mutex poisoned");
        if *st != TaskState::Stopped {
            return Err(ServoError::InvalidStateTransition {
                from: st.to_string(),
                to: "RESET".to_string(),
            });
        }
        drop(st);
        self.telemetry.reset();
        debug!(task = %self.name, "telemetry reset");
        Ok(())
    }

    /// Snapshot of the live timing telemetry.
    #[must_use]
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Shared handle to the telemetry cells, for the poller thread.
    #[must_use]
    pub fn telemetry_handle(&self) -> Arc<TaskTelemetry> {
        Arc::clone(&self.telemetry)
    }

    fn request_destroy(&self) {
        let _st = self.shared.lifecycle.lock().expect("lifecycle mutex poisoned");
        self.shared
            .request
            .store(TaskState::Destroying as u8, Ordering::Release);
        self.shared.lifecycle_cv.notify_all();
    }

    /// Graceful teardown: request DESTROYING, wake the thread, join it.
    ///
    /// Must not be used after an emergency: a thread frozen inside the
    /// interlock never observes the request; use
    /// [`force_destroy`](Self::force_destroy) there.
    pub fn destroy(mut self) {
        self.request_destroy();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(task = %self.name, "task thread panicked before join");
            }
        }
        info!(task = %self.name, "task destroyed");
    }

    /// Non-cooperative teardown for the emergency path.
    ///
    /// Cancels the backing thread unconditionally and detaches it; a
    /// cancelled thread never writes its completion packet, so it must not
    /// be joined. Only sound once `declare_handled()` has released every
    /// frozen `check` caller into its terminal sleep loop.
    pub fn force_destroy(mut self) {
        self.request_destroy();
        if let Some(handle) = self.handle.take() {
            #[cfg(unix)]
            {
                use std::os::unix::thread::JoinHandleExt;
                let pthread = handle.into_pthread_t();
                // SAFETY: the thread is parked in a sleep loop (a
                // cancellation point) and holds no locks there; a cancelled
                // thread is never joined, so detach it to reap its storage
                #[allow(unsafe_code)]
                unsafe {
                    libc::pthread_cancel(pthread);
                    libc::pthread_detach(pthread);
                }
            }
            #[cfg(not(unix))]
            drop(handle);
            warn!(task = %self.name, "task force-destroyed");
        }
    }
}

impl Drop for RealtimeTask {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.request_destroy();

        // Bounded wait for the thread to confirm DESTROYING; a frozen
        // thread never will, so detach it rather than hang the caller.
        let mut st = self.shared.lifecycle.lock().expect("lifecycle mutex poisoned");
        let deadline = std::time::Instant::now() + DROP_JOIN_TIMEOUT;
        while *st != TaskState::Destroying {
            let now = std::time::Instant::now();
            if now >= deadline {
                warn!(task = %self.name, "backing thread unresponsive, detaching");
                drop(st);
                drop(handle);
                return;
            }
            let (guard, _) = self
                .shared
                .lifecycle_cv
                .wait_timeout(st, deadline - now)
                .expect("lifecycle mutex poisoned");
            st = guard;
        }
        drop(st);
        let _ = handle.join();
    }
}

/// Backing thread entry: RT setup, then park/run until DESTROYING.
fn thread_main(
    shared: &Arc<TaskShared>,
    telemetry: &Arc<TaskTelemetry>,
    cycle_slot: &Arc<Mutex<Option<CycleFn>>>,
    period: Period,
    cpu: usize,
    strategy: WaitStrategy,
    name: &str,
) {
    if let Err(e) = rt::pin_to_cpu(cpu) {
        warn!(task = name, error = %e, "CPU pinning failed");
    }
    if let Err(e) = rt::set_fifo_max_priority() {
        warn!(task = name, error = %e, "RT scheduling setup failed");
    }
    if strategy == WaitStrategy::NoIdleGap {
        // This loop will never yield its core voluntarily
        rt::set_soft_lockup_watchdog(false);
    }

    loop {
        // Park until a start or destroy request arrives.
        let request = {
            let mut st = shared.lifecycle.lock().expect("lifecycle mutex poisoned");
            loop {
                match shared.request_state() {
                    req @ (TaskState::Starting | TaskState::Destroying) => break req,
                    TaskState::Stopping => {
                        // A stop overtook the start before the session began
                        *st = TaskState::Stopped;
                        shared
                            .request
                            .store(TaskState::Idle as u8, Ordering::Release);
                        shared.lifecycle_cv.notify_all();
                    }
                    _ => {}
                }
                st = shared
                    .lifecycle_cv
                    .wait(st)
                    .expect("lifecycle mutex poisoned");
            }
        };
        if request == TaskState::Destroying {
            break;
        }

        shared.confirm(TaskState::Starting);
        debug!(task = name, "session starting");

        let mut cycle_fn = cycle_slot.lock().expect("cycle slot mutex poisoned").take();
        if cycle_fn.is_none() {
            warn!(task = name, "no cycle function installed, running no-op cycles");
        }

        let exit_request = run_session(shared, telemetry, &mut cycle_fn, period, strategy, name);

        if let Some(f) = cycle_fn {
            cycle_slot
                .lock()
                .expect("cycle slot mutex poisoned")
                .replace(f);
        }

        {
            let mut st = shared.lifecycle.lock().expect("lifecycle mutex poisoned");
            *st = TaskState::Stopped;
            if exit_request != TaskState::Destroying {
                shared
                    .request
                    .store(TaskState::Idle as u8, Ordering::Release);
            }
            shared.lifecycle_cv.notify_all();
        }
        info!(task = name, "session stopped");

        if exit_request == TaskState::Destroying {
            break;
        }
    }

    shared.confirm(TaskState::Destroying);
    debug!(task = name, "backing thread exiting");
}

/// The cyclic loop. Returns the lifecycle request that ended the session.
fn run_session(
    shared: &TaskShared,
    telemetry: &TaskTelemetry,
    cycle_fn: &mut Option<CycleFn>,
    period: Period,
    strategy: WaitStrategy,
    name: &str,
) -> TaskState {
    let clock = MonotonicClock::new();
    let period_ns = period.as_ns();

    // Running extrema carry over from any previous session: only reset()
    // clears them. The cells start out seeded with the nominal period.
    let seed = telemetry.snapshot();
    let mut max_period = seed.running_max_period;
    let mut min_period = seed.running_min_period;

    let mut prev_start_ns = clock.now_ns();
    let mut consumed = 0.0_f64;
    let mut first_cycle = true;
    let mut confirmed_running = false;

    loop {
        let start_ns = clock.now_ns();
        let elapsed = ns_to_secs(start_ns);
        // Cycle 1 has no meaningful inter-cycle delta
        let measured = if first_cycle {
            0.0
        } else {
            ns_to_secs(start_ns - prev_start_ns)
        };
        prev_start_ns = start_ns;

        let wait_for_tick = match cycle_fn.as_mut() {
            Some(f) => f(elapsed, measured, consumed),
            None => true,
        };
        let skip_wait = !wait_for_tick;

        if strategy == WaitStrategy::InsertIdleGap {
            rt::yield_idle_gap();
        }

        let end_ns = clock.now_ns();
        consumed = ns_to_secs(end_ns - start_ns);

        if !first_cycle {
            if measured > max_period {
                max_period = measured;
            }
            if measured < min_period {
                min_period = measured;
            }
        }
        telemetry.publish(elapsed, measured, consumed, max_period, min_period);

        if !confirmed_running {
            shared.confirm(TaskState::Running);
            confirmed_running = true;
            info!(task = name, "confirmed RUNNING");
        }

        // An overrun polls straight past the already-elapsed tick: the
        // schedule slips, no cycle is ever dropped.
        let next_tick = start_ns.saturating_add(period_ns);
        let exit = loop {
            match shared.request_state() {
                req @ (TaskState::Stopping | TaskState::Destroying) => break Some(req),
                _ => {}
            }
            if skip_wait || clock.now_ns() >= next_tick {
                break None;
            }
            std::hint::spin_loop();
        };
        if let Some(req) = exit {
            return req;
        }
        first_cycle = false;
    }
}
