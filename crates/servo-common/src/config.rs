//! Configuration structures for the servo control kernel.
//!
//! Supports TOML deserialization with sensible defaults for development
//! and explicit values for production deployment. One `[[tasks]]` table per
//! periodic control task, ordered fastest-period-first.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Top-level kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Periodic control tasks, fastest sampling period first.
    pub tasks: Vec<TaskConfig>,

    /// Telemetry poller configuration.
    pub telemetry: TelemetryConfig,

    /// Memory locking and stack pre-faulting.
    pub memory: MemoryConfig,

    /// Append-only fault log file. Disabled when unset.
    pub fault_log: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tasks: vec![TaskConfig::default()],
            telemetry: TelemetryConfig::default(),
            memory: MemoryConfig::default(),
            fault_log: None,
        }
    }
}

/// Configuration of one periodic real-time task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Task name, used in logs and telemetry output.
    pub name: String,

    /// Sampling period. Must be strictly positive.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// CPU core the backing thread is pinned to.
    pub cpu: usize,

    /// How the cyclic loop waits for the next tick.
    pub wait_strategy: WaitStrategy,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: String::from("control"),
            period: Duration::from_millis(1),
            cpu: 0,
            wait_strategy: WaitStrategy::InsertIdleGap,
        }
    }
}

/// Wait strategy for the cyclic busy-poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Yield the CPU once per cycle. Slightly more jitter, but
    /// equal-priority threads sharing the core stay scheduled and the
    /// kernel's soft-lockup detector stays happy.
    #[default]
    InsertIdleGap,
    /// Never yield the CPU voluntarily. Lowest jitter; requires the
    /// soft-lockup watchdog to be disabled at task construction.
    NoIdleGap,
}

/// Telemetry poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Enable the non-real-time telemetry poller thread.
    pub enabled: bool,

    /// Coarse poll interval. Has no effect on control correctness.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Memory locking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Lock all memory pages (mlockall) at startup.
    pub lock_memory: bool,

    /// Pre-fault stack size in bytes.
    pub prefault_stack_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            lock_memory: false,
            prefault_stack_size: 8 * 1024 * 1024, // 8 MiB
        }
    }
}

impl KernelConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate the task table.
    ///
    /// Zero periods are rejected. Non-ascending period order is only
    /// warned about: fastest-first is a documented precondition of the
    /// orchestrator, not an enforced invariant.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for an empty task table or a zero period.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.is_empty() {
            return Err(ConfigError::Invalid("no tasks configured".into()));
        }
        for task in &self.tasks {
            if task.period.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "task '{}' has a zero period",
                    task.name
                )));
            }
        }
        for pair in self.tasks.windows(2) {
            if pair[0].period > pair[1].period {
                warn!(
                    first = %pair[0].name,
                    second = %pair[1].name,
                    "tasks are not ordered fastest-period-first"
                );
            }
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
