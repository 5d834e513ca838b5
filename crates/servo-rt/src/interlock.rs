//! Process-wide emergency-stop interlock.
//!
//! One `EmergencyInterlock` exists per control session, shared by handle
//! (`Arc`) with every component that checks invariants; there are no
//! process statics. The `check` primitive is called pervasively, including
//! from inside cyclic control functions, and guarantees that a failed
//! invariant can never return control to a corrupted control cycle:
//!
//! - In **realtime mode** (tasks running, actuators live) the failing
//!   thread freezes in place. It first waits for the supervisor to declare
//!   the emergency handled (meaning every actuator output has been zeroed
//!   by supervisory code), then logs the failure site and never returns.
//!   An uncontrolled process exit here would leave outputs at their last
//!   control-loop value, which may be unsafe; a frozen thread retains
//!   whatever the shutdown path wrote.
//! - In **non-realtime mode** (no session armed) the process terminates
//!   immediately with a printed diagnostic and non-zero status.

use crate::faultlog::FaultLog;
use crate::rt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{error, info};

/// How often a frozen `check` caller polls for the handled flag.
const HANDLED_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sleep interval of the terminal freeze loop.
const FREEZE_INTERVAL: Duration = Duration::from_secs(1);

/// Source location of the first failed invariant in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSite {
    /// Text of the violated condition.
    pub condition: String,
    /// Source file of the failed check.
    pub file: String,
    /// Source line of the failed check.
    pub line: u32,
}

#[derive(Debug)]
struct InterlockState {
    realtime_mode: bool,
    emergency: bool,
    handled: bool,
    site: Option<FailureSite>,
}

type FailHook = Box<dyn Fn(&FailureSite) + Send + Sync>;

/// Shared fail-safe state for one control session.
pub struct EmergencyInterlock {
    state: Mutex<InterlockState>,
    tripped: Condvar,
    fail_hook: FailHook,
    fault_log: Option<Arc<FaultLog>>,
}

impl std::fmt::Debug for EmergencyInterlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyInterlock")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for EmergencyInterlock {
    fn default() -> Self {
        Self::new()
    }
}

impl EmergencyInterlock {
    /// Create an interlock whose non-realtime failure path terminates the
    /// process with status 1.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fail_hook(Box::new(|site| {
            eprintln!(
                "invariant violated: {} at {}:{}",
                site.condition, site.file, site.line
            );
            std::process::exit(1);
        }))
    }

    /// Create an interlock with a custom non-realtime failure action.
    ///
    /// Production code uses `new()`; tests inject a hook so the fail-fast
    /// branch can be observed without killing the test process.
    #[must_use]
    pub fn with_fail_hook(fail_hook: FailHook) -> Self {
        Self {
            state: Mutex::new(InterlockState {
                realtime_mode: false,
                emergency: false,
                handled: false,
                site: None,
            }),
            tripped: Condvar::new(),
            fail_hook,
            fault_log: None,
        }
    }

    /// Attach an append-only fault log to the trip path.
    pub fn set_fault_log(&mut self, log: Arc<FaultLog>) {
        self.fault_log = Some(log);
    }

    /// Check one invariant.
    ///
    /// A true `assertion` is a no-op. The first false assertion of a session
    /// records `(condition, file, line)` and declares the emergency; later
    /// failures do not overwrite the recorded site. A failing call never
    /// returns in realtime mode, and terminates the process in non-realtime
    /// mode (unless a test hook was injected).
    pub fn check(&self, assertion: bool, condition: &str, file: &str, line: u32) {
        if assertion {
            return;
        }

        let (realtime, site) = {
            let mut st = self.state.lock().expect("interlock mutex poisoned");
            if !st.emergency {
                st.emergency = true;
                st.site = Some(FailureSite {
                    condition: condition.to_string(),
                    file: file.to_string(),
                    line,
                });
                error!(condition, file, line, "invariant violated, emergency declared");
                if let Some(log) = &self.fault_log {
                    log.append(rt::current_cpu(), file, line, condition);
                }
                self.tripped.notify_all();
            }
            (
                st.realtime_mode,
                st.site.clone().unwrap_or_else(|| FailureSite {
                    condition: condition.to_string(),
                    file: file.to_string(),
                    line,
                }),
            )
        };

        if realtime {
            self.freeze_in_place(&site);
        } else {
            error!(
                condition = %site.condition,
                file = %site.file,
                line = site.line,
                "invariant violated outside a control session, terminating"
            );
            (self.fail_hook)(&site);
        }
    }

    /// Hold the failing thread here forever.
    ///
    /// Waits (low-frequency poll, no condvar: the waiters must stay
    /// cancellable and must never contend with the supervisor) until the
    /// supervisor has zeroed the actuator outputs, then logs and freezes.
    fn freeze_in_place(&self, site: &FailureSite) {
        loop {
            {
                let st = self.state.lock().expect("interlock mutex poisoned");
                if st.handled {
                    break;
                }
            }
            std::thread::sleep(HANDLED_POLL_INTERVAL);
        }

        error!(
            condition = %site.condition,
            file = %site.file,
            line = site.line,
            cpu = rt::current_cpu(),
            "emergency handled, control cycle frozen in place"
        );

        loop {
            std::thread::sleep(FREEZE_INTERVAL);
        }
    }

    /// Block the calling supervisory thread until an emergency is declared.
    pub fn wait_for_emergency(&self) {
        let mut st = self.state.lock().expect("interlock mutex poisoned");
        while !st.emergency {
            st = self.tripped.wait(st).expect("interlock mutex poisoned");
        }
    }

    /// Like [`wait_for_emergency`](Self::wait_for_emergency) but bounded.
    ///
    /// Returns `true` if an emergency was declared within `timeout`.
    pub fn wait_for_emergency_timeout(&self, timeout: Duration) -> bool {
        let mut st = self.state.lock().expect("interlock mutex poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while !st.emergency {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _result) = self
                .tripped
                .wait_timeout(st, deadline - now)
                .expect("interlock mutex poisoned");
            st = guard;
        }
        true
    }

    /// Declare the emergency handled.
    ///
    /// Called by the supervisor once every task has been safely stopped and
    /// all actuator outputs zeroed; releases threads waiting inside a
    /// failed `check` into their terminal freeze.
    pub fn declare_handled(&self) {
        let mut st = self.state.lock().expect("interlock mutex poisoned");
        st.handled = true;
        info!("emergency declared handled");
    }

    /// Switch between realtime (freeze) and non-realtime (fail-fast) modes.
    ///
    /// Called by the orchestrator at session boundaries only (after all
    /// tasks confirm RUNNING, and before a graceful stop), never from
    /// inside a cyclic loop.
    pub fn set_realtime_mode(&self, realtime: bool) {
        let mut st = self.state.lock().expect("interlock mutex poisoned");
        st.realtime_mode = realtime;
        info!(realtime, "interlock mode switched");
    }

    /// Arm a fresh control session: clears the emergency, handled flag,
    /// and recorded failure site.
    pub fn arm(&self) {
        let mut st = self.state.lock().expect("interlock mutex poisoned");
        st.emergency = false;
        st.handled = false;
        st.site = None;
        info!("interlock armed for a new session");
    }

    /// Whether an emergency has been declared this session.
    #[must_use]
    pub fn is_emergency(&self) -> bool {
        self.state.lock().expect("interlock mutex poisoned").emergency
    }

    /// Whether the emergency has been declared handled.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.state.lock().expect("interlock mutex poisoned").handled
    }

    /// Whether the interlock is in realtime mode.
    #[must_use]
    pub fn is_realtime_mode(&self) -> bool {
        self.state
            .lock()
            .expect("interlock mutex poisoned")
            .realtime_mode
    }

    /// The first recorded failure site of this session, if any.
    #[must_use]
    pub fn failure_site(&self) -> Option<FailureSite> {
        self.state
            .lock()
            .expect("interlock mutex poisoned")
            .site
            .clone()
    }
}

/// Check a runtime invariant against an interlock handle.
///
/// Captures the condition text and call site. Compile-time-provable
/// invariants should stay plain `debug_assert!`; this macro is for
/// conditions that depend on runtime data or hardware state.
#[macro_export]
macro_rules! verify {
    ($interlock:expr, $cond:expr) => {
        $interlock.check($cond, stringify!($cond), file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_interlock() -> (Arc<EmergencyInterlock>, Arc<AtomicUsize>) {
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook_calls_clone = Arc::clone(&hook_calls);
        let interlock = Arc::new(EmergencyInterlock::with_fail_hook(Box::new(move |_| {
            hook_calls_clone.fetch_add(1, Ordering::SeqCst);
        })));
        (interlock, hook_calls)
    }

    #[test]
    fn test_passing_check_is_noop() {
        let (interlock, hook_calls) = counting_interlock();
        interlock.check(true, "always", "t.rs", 1);
        assert!(!interlock.is_emergency());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_failure_records_site() {
        let (interlock, _) = counting_interlock();
        interlock.check(false, "x > 0", "f.rs", 42);
        assert!(interlock.is_emergency());
        let site = interlock.failure_site().unwrap();
        assert_eq!(site.condition, "x > 0");
        assert_eq!(site.file, "f.rs");
        assert_eq!(site.line, 42);
    }

    #[test]
    fn test_second_failure_does_not_overwrite() {
        let (interlock, hook_calls) = counting_interlock();
        interlock.check(false, "first", "a.rs", 1);
        interlock.check(false, "second", "b.rs", 2);
        assert_eq!(interlock.failure_site().unwrap().condition, "first");
        // Non-realtime branch ran for both calls
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_single_fire() {
        let (interlock, _) = counting_interlock();
        let mut handles = Vec::new();
        for i in 0..8 {
            let interlock = Arc::clone(&interlock);
            handles.push(std::thread::spawn(move || {
                interlock.check(false, "concurrent", "c.rs", i);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(interlock.is_emergency());
        // Exactly one site recorded; all callers observe the emergency
        assert_eq!(interlock.failure_site().unwrap().condition, "concurrent");
    }

    #[test]
    fn test_realtime_failure_freezes_until_handled() {
        let (interlock, hook_calls) = counting_interlock();
        interlock.set_realtime_mode(true);

        let progressed = Arc::new(AtomicUsize::new(0));
        let progressed_clone = Arc::clone(&progressed);
        let interlock_clone = Arc::clone(&interlock);
        // Detached: this thread freezes forever by design
        std::thread::spawn(move || {
            interlock_clone.check(false, "frozen", "f.rs", 1);
            progressed_clone.fetch_add(1, Ordering::SeqCst);
        });

        interlock.wait_for_emergency();
        std::thread::sleep(Duration::from_millis(100));
        // Caller must not have returned before declare_handled
        assert_eq!(progressed.load(Ordering::SeqCst), 0);
        // The fail-fast hook must not run in realtime mode
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);

        interlock.declare_handled();
        std::thread::sleep(Duration::from_millis(100));
        // Even after handling, the caller stays frozen forever
        assert_eq!(progressed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_nonrealtime_failure_runs_fail_hook() {
        let (interlock, hook_calls) = counting_interlock();
        interlock.check(false, "fail fast", "f.rs", 9);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_for_emergency_timeout() {
        let (interlock, _) = counting_interlock();
        assert!(!interlock.wait_for_emergency_timeout(Duration::from_millis(20)));
        interlock.check(false, "now", "n.rs", 1);
        assert!(interlock.wait_for_emergency_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_arm_clears_session_state() {
        let (interlock, _) = counting_interlock();
        interlock.check(false, "stale", "s.rs", 1);
        interlock.declare_handled();
        assert!(interlock.is_emergency());
        assert!(interlock.is_handled());

        interlock.arm();
        assert!(!interlock.is_emergency());
        assert!(!interlock.is_handled());
        assert!(interlock.failure_site().is_none());
    }

    #[test]
    fn test_verify_macro_captures_site() {
        let (interlock, _) = counting_interlock();
        let x = -1;
        verify!(interlock, x > 0);
        let site = interlock.failure_site().unwrap();
        assert_eq!(site.condition, "x > 0");
        assert!(site.file.ends_with("interlock.rs"));
    }
}
