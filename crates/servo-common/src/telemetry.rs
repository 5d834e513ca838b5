//! Lock-free per-task timing telemetry.
//!
//! Each periodic task owns one `TaskTelemetry` and is its only writer; any
//! other thread may read it at any time. Fields are `f64` values stored as
//! their bit patterns in relaxed atomics, so the hot loop publishes with
//! plain stores and readers can never observe a torn double. Cache-line
//! padding keeps the writer from false-sharing with pollers.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// One `f64` cell written by a single task thread, read by anyone.
#[derive(Debug)]
struct F64Cell(CachePadded<AtomicU64>);

impl F64Cell {
    fn new(value: f64) -> Self {
        Self(CachePadded::new(AtomicU64::new(value.to_bits())))
    }

    #[inline]
    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Live timing telemetry of one periodic task, all values in seconds.
///
/// `running_max_period` only grows and `running_min_period` only shrinks
/// between resets; both are seeded with the nominal period.
#[derive(Debug)]
pub struct TaskTelemetry {
    /// Time since the current session started.
    current_time: F64Cell,
    /// Inter-cycle interval measured on the last cycle.
    measured_period: F64Cell,
    /// Computation time consumed by the last cycle.
    consumed_time: F64Cell,
    /// Largest measured period since the last reset.
    running_max_period: F64Cell,
    /// Smallest measured period since the last reset.
    running_min_period: F64Cell,
    /// Nominal period, fixed at construction.
    nominal_period: f64,
}

impl TaskTelemetry {
    /// Create telemetry seeded for a task with the given nominal period (seconds).
    #[must_use]
    pub fn new(nominal_period: f64) -> Self {
        Self {
            current_time: F64Cell::new(0.0),
            measured_period: F64Cell::new(0.0),
            consumed_time: F64Cell::new(0.0),
            running_max_period: F64Cell::new(nominal_period),
            running_min_period: F64Cell::new(nominal_period),
            nominal_period,
        }
    }

    /// Publish one cycle's measurements. Called only by the owning task thread.
    #[inline]
    pub fn publish(
        &self,
        current_time: f64,
        measured_period: f64,
        consumed_time: f64,
        running_max_period: f64,
        running_min_period: f64,
    ) {
        self.current_time.store(current_time);
        self.measured_period.store(measured_period);
        self.consumed_time.store(consumed_time);
        self.running_max_period.store(running_max_period);
        self.running_min_period.store(running_min_period);
    }

    /// Restore the initial values: zeroed measurements, extrema at nominal.
    pub fn reset(&self) {
        self.current_time.store(0.0);
        self.measured_period.store(0.0);
        self.consumed_time.store(0.0);
        self.running_max_period.store(self.nominal_period);
        self.running_min_period.store(self.nominal_period);
    }

    /// Nominal period in seconds.
    #[must_use]
    pub fn nominal_period(&self) -> f64 {
        self.nominal_period
    }

    /// Take a snapshot of the current values.
    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            current_time: self.current_time.load(),
            measured_period: self.measured_period.load(),
            consumed_time: self.consumed_time.load(),
            running_max_period: self.running_max_period.load(),
            running_min_period: self.running_min_period.load(),
        }
    }
}

/// Point-in-time copy of one task's telemetry, all values in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySnapshot {
    /// Time since the current session started.
    pub current_time: f64,
    /// Inter-cycle interval measured on the last cycle.
    pub measured_period: f64,
    /// Computation time consumed by the last cycle.
    pub consumed_time: f64,
    /// Largest measured period since the last reset.
    pub running_max_period: f64,
    /// Smallest measured period since the last reset.
    pub running_min_period: f64,
}

impl TelemetrySnapshot {
    /// Peak-to-peak jitter (max minus min measured period), in seconds.
    #[must_use]
    pub fn jitter(&self) -> f64 {
        self.running_max_period - self.running_min_period
    }
}
