use thiserror::Error;

/// Kernel error types covering configuration, lifecycle faults, and OS failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServoError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic runtime fault.
    #[error("runtime fault: {0}")]
    Fault(String),

    /// A period must be a positive number of nanoseconds.
    #[error("invalid period: {0}ns (must be > 0)")]
    InvalidPeriod(u64),

    /// Invalid lifecycle transition attempted.
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// OS resource failure (thread creation, scheduler, affinity).
    #[error("OS error: {0}")]
    Os(String),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Convenience type alias for kernel operations.
pub type ServoResult<T> = Result<T, ServoError>;
