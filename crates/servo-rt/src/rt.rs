//! Real-time scheduling and memory locking glue.
//!
//! Per-thread initialization for deterministic execution:
//! - CPU affinity to pin a control thread to one isolated core
//! - SCHED_FIFO at the maximum priority the policy allows
//! - Soft-lockup watchdog tunable for threads that never yield
//! - Memory locking (mlockall) and stack pre-faulting at process startup
//!
//! Full support on Linux with a PREEMPT_RT kernel; degrades to warnings on
//! other platforms and on hosts without RT privileges (EPERM).

#![allow(unused_imports)] // Platform-specific code may not use all imports

use servo_common::error::{ServoError, ServoResult};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Path of the kernel soft-lockup watchdog tunable.
#[cfg(target_os = "linux")]
const SOFT_LOCKUP_WATCHDOG_PATH: &str = "/proc/sys/kernel/watchdog";

/// Request SCHED_FIFO at the maximum obtainable priority for the calling thread.
///
/// Returns the applied priority, or `None` when the host refuses RT
/// scheduling with EPERM (no CAP_SYS_NICE); that case is logged and the
/// thread continues time-shared.
///
/// # Errors
///
/// Returns `ServoError::Os` for any failure other than EPERM.
#[cfg(target_os = "linux")]
pub fn set_fifo_max_priority() -> ServoResult<Option<i32>> {
    // SAFETY: sched_get_priority_max has no preconditions
    let max_priority = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    if max_priority == -1 {
        return Err(ServoError::Os(format!(
            "sched_get_priority_max failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let param = libc::sched_param {
        sched_priority: max_priority,
    };

    // SAFETY: param is a valid sched_param for the calling thread (pid 0)
    let result = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!(
                "sched_setscheduler failed with EPERM - running without RT privileges. \
                 Consider running with CAP_SYS_NICE capability or as root."
            );
            return Ok(None);
        }
        return Err(ServoError::Os(format!("sched_setscheduler failed: {err}")));
    }

    info!(priority = max_priority, "SCHED_FIFO applied");
    Ok(Some(max_priority))
}

#[cfg(not(target_os = "linux"))]
pub fn set_fifo_max_priority() -> ServoResult<Option<i32>> {
    warn!("SCHED_FIFO not available on this platform");
    Ok(None)
}

/// Pin the calling thread to a single CPU core.
///
/// Returns `false` (with a warning) when the core index does not exist on
/// this host, so a config written for a larger machine still runs.
///
/// # Errors
///
/// Returns `ServoError::Os` for affinity failures other than EINVAL.
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu: usize) -> ServoResult<bool> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(cpu)
        .map_err(|e| ServoError::Config(format!("invalid CPU index {cpu}: {e}")))?;

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            debug!(cpu, "CPU affinity set");
            Ok(true)
        }
        Err(e) => {
            if e == nix::errno::Errno::EINVAL {
                warn!(cpu, "CPU does not exist on this host, affinity not set");
                Ok(false)
            } else {
                Err(ServoError::Os(format!("sched_setaffinity failed: {e}")))
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(cpu: usize) -> ServoResult<bool> {
    warn!(cpu, "CPU affinity not available on this platform");
    Ok(false)
}

/// Enable or disable the kernel soft-lockup watchdog.
///
/// A NoIdleGap cyclic loop never yields its core voluntarily, which some
/// kernels treat as a hard lockup and panic on. Best-effort: returns whether
/// the tunable was written.
#[cfg(target_os = "linux")]
pub fn set_soft_lockup_watchdog(enabled: bool) -> bool {
    let value = if enabled { "1" } else { "0" };
    match std::fs::write(SOFT_LOCKUP_WATCHDOG_PATH, value) {
        Ok(()) => {
            info!(enabled, "soft-lockup watchdog tunable written");
            true
        }
        Err(e) => {
            warn!(
                enabled,
                error = %e,
                "could not write soft-lockup watchdog tunable"
            );
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_soft_lockup_watchdog(_enabled: bool) -> bool {
    false
}

/// One voluntary scheduler yield.
///
/// Moves the calling thread to the back of the runqueue for its priority,
/// so an equal-priority SCHED_FIFO thread sharing the core gets to run.
/// The single syscall is also enough for the kernel to stop counting this
/// core as hard-locked, at the cost of a small amount of added jitter.
#[cfg(target_os = "linux")]
#[inline]
pub fn yield_idle_gap() {
    // SAFETY: sched_yield has no preconditions
    unsafe {
        libc::sched_yield();
    }
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub fn yield_idle_gap() {
    std::thread::yield_now();
}

/// CPU core the calling thread is currently executing on, or -1 if unknown.
#[cfg(target_os = "linux")]
#[must_use]
pub fn current_cpu() -> i32 {
    // SAFETY: sched_getcpu has no preconditions
    unsafe { libc::sched_getcpu() }
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn current_cpu() -> i32 {
    -1
}

/// Lock all current and future memory pages.
///
/// # Errors
///
/// Returns `ServoError::Os` for failures other than EPERM; EPERM (no
/// CAP_IPC_LOCK) degrades to a warning and `Ok(false)`.
#[cfg(target_os = "linux")]
pub fn lock_memory() -> ServoResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    debug!("locking memory pages with mlockall");

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("memory locked");
            Ok(true)
        }
        Err(e) => {
            if e == nix::errno::Errno::EPERM {
                warn!(
                    "mlockall failed with EPERM - running without CAP_IPC_LOCK. \
                     Page faults may occur during execution."
                );
                Ok(false)
            } else {
                Err(ServoError::Os(format!("mlockall failed: {e}")))
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn lock_memory() -> ServoResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Pre-fault stack pages so the cyclic loop never takes a stack page fault.
///
/// Touches pages with a recursive helper on the actual stack; returns the
/// number of bytes faulted.
pub fn prefault_stack(size: usize) -> usize {
    if size == 0 {
        return 0;
    }

    debug!(size, "pre-faulting stack pages");
    let faulted = prefault_stack_recursive(size, 0);
    debug!(faulted, "stack pre-fault complete");
    faulted
}

#[inline(never)]
fn prefault_stack_recursive(remaining: usize, depth: usize) -> usize {
    const FRAME_SIZE: usize = 4096;
    const MAX_DEPTH: usize = 1000;

    if remaining < FRAME_SIZE || depth >= MAX_DEPTH {
        return 0;
    }

    let mut buffer = [0u8; FRAME_SIZE];
    // SAFETY: writing to our own stack allocation
    unsafe {
        std::ptr::write_volatile(buffer.as_mut_ptr(), 0xAA);
        std::ptr::write_volatile(buffer.as_mut_ptr().add(FRAME_SIZE - 1), 0xBB);
    }
    std::hint::black_box(&buffer);

    FRAME_SIZE + prefault_stack_recursive(remaining - FRAME_SIZE, depth + 1)
}

/// Information about real-time capabilities of the host.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    /// Whether running as root.
    pub is_root: bool,
    /// RLIMIT_RTPRIO value (max RT priority allowed).
    pub rtprio_limit: Option<u64>,
    /// RLIMIT_MEMLOCK value (max lockable memory).
    pub memlock_limit: Option<u64>,
    /// Whether running on a PREEMPT_RT kernel.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Check if RT scheduling is likely to succeed.
    #[must_use]
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }

    /// Check if memory locking is likely to succeed.
    #[must_use]
    pub fn can_lock_memory(&self) -> bool {
        if self.is_root {
            return true;
        }

        #[cfg(target_family = "unix")]
        {
            self.memlock_limit.is_some_and(|l| l == libc::RLIM_INFINITY)
        }

        #[cfg(not(target_family = "unix"))]
        {
            false
        }
    }
}

/// Probe RT capabilities of the current process.
#[cfg(target_os = "linux")]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    use std::fs;

    let mut caps = RtCapabilities {
        // SAFETY: geteuid has no preconditions
        is_root: unsafe { libc::geteuid() } == 0,
        ..Default::default()
    };

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: rlim is a valid out-pointer
    if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut rlim) } == 0 {
        caps.rtprio_limit = Some(rlim.rlim_cur);
    }
    // SAFETY: rlim is a valid out-pointer
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) } == 0 {
        caps.memlock_limit = Some(rlim.rlim_cur);
    }

    if let Ok(version) = fs::read_to_string("/proc/version") {
        caps.preempt_rt = version.contains("PREEMPT_RT") || version.contains("PREEMPT RT");
    }

    caps
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}
