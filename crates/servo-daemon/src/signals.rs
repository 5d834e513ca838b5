//! Signal handling for graceful daemon shutdown.
//!
//! SIGTERM and SIGINT request a graceful stop of the control session.
//! Handlers only flip an atomic flag (the only async-signal-safe thing they
//! may do); the main loop polls it between supervision rounds.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

// Written from the signal handlers, read by every SignalHandler clone.
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

/// Handle for checking shutdown requests.
#[derive(Clone)]
pub struct SignalHandler {
    /// Programmatic shutdown, separate from the OS signal path so tests
    /// never have to raise real signals.
    manual: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register the OS signal handlers.
    ///
    /// On non-Unix platforms only the manual shutdown path is available.
    pub fn new() -> std::io::Result<Self> {
        #[cfg(unix)]
        register_unix_handlers();

        Ok(Self {
            manual: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether a shutdown has been requested by signal or manually.
    #[inline]
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_FLAG.load(Ordering::Relaxed) || self.manual.load(Ordering::Relaxed)
    }

    /// Request shutdown from any thread.
    pub fn request_shutdown(&self) {
        info!("manual shutdown requested");
        self.manual.store(true, Ordering::Relaxed);
    }

    /// Number of OS signals received so far.
    #[must_use]
    pub fn signal_count(&self) -> u32 {
        SIGNAL_COUNT.load(Ordering::Relaxed)
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new().expect("failed to create signal handler")
    }
}

#[cfg(unix)]
fn register_unix_handlers() {
    use std::os::raw::c_int;

    extern "C" fn shutdown_handler(_: c_int) {
        SHUTDOWN_FLAG.store(true, Ordering::Relaxed);
        SIGNAL_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    // SAFETY: the handler only touches atomics, which is async-signal-safe
    #[allow(unsafe_code)]
    unsafe {
        libc::signal(libc::SIGTERM, shutdown_handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, shutdown_handler as libc::sighandler_t);
    }
    debug!("Unix signal handlers registered");
}

/// Block until shutdown is requested or `timeout` expires.
///
/// Returns `true` if shutdown was signaled.
pub fn wait_for_shutdown(handler: &SignalHandler, timeout: Duration) -> bool {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(50);

    loop {
        if handler.shutdown_requested() {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return false;
        }
        std::thread::sleep(poll_interval.min(timeout - elapsed));
    }
}
