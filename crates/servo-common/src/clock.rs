//! Monotonic time arithmetic for periodic scheduling.
//!
//! A `Period` is the fixed inter-cycle interval of one periodic task, and a
//! `MonotonicClock` is an anchored monotonic timebase read as nanoseconds
//! since its creation. Everything here is pure arithmetic: no threads, no
//! syscalls beyond the clock read.

use crate::error::{ServoError, ServoResult};
use std::time::{Duration, Instant};

/// Nanoseconds per second, as a float, for telemetry conversions.
pub const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Convert a nanosecond count to seconds.
#[inline]
#[must_use]
pub fn ns_to_secs(ns: u64) -> f64 {
    ns as f64 / NANOS_PER_SEC
}

/// Fixed sampling period of a periodic task, in nanoseconds.
///
/// Immutable for the lifetime of a task. Always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Period(u64);

impl Period {
    /// Create a period from a nanosecond count.
    ///
    /// # Errors
    ///
    /// Returns `ServoError::InvalidPeriod` if `ns` is zero.
    pub fn from_ns(ns: u64) -> ServoResult<Self> {
        if ns == 0 {
            return Err(ServoError::InvalidPeriod(ns));
        }
        Ok(Self(ns))
    }

    /// Create a period from a `Duration`.
    ///
    /// # Errors
    ///
    /// Returns `ServoError::InvalidPeriod` if the duration is zero or does
    /// not fit in 64 bits of nanoseconds.
    pub fn from_duration(d: Duration) -> ServoResult<Self> {
        let ns = u64::try_from(d.as_nanos())
            .map_err(|_| ServoError::InvalidPeriod(u64::MAX))?;
        Self::from_ns(ns)
    }

    /// Period length in nanoseconds.
    #[inline]
    #[must_use]
    pub fn as_ns(&self) -> u64 {
        self.0
    }

    /// Period length as a `Duration`.
    #[inline]
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.0)
    }

    /// Period length in seconds.
    #[inline]
    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        ns_to_secs(self.0)
    }

    /// Number of whole periods that fit in `window`.
    #[must_use]
    pub fn cycles_in(&self, window: Duration) -> u64 {
        let window_ns = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        window_ns / self.0
    }
}

/// An anchored monotonic timebase.
///
/// Reads never go backwards; arithmetic on the returned nanosecond counts is
/// plain unsigned integer math against a shared origin.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Anchor a new timebase at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the timebase origin.
    #[inline]
    #[must_use]
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Seconds elapsed since the timebase origin.
    #[inline]
    #[must_use]
    pub fn now_secs(&self) -> f64 {
        ns_to_secs(self.now_ns())
    }
}
