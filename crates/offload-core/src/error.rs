//! Error types for offload operations.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for offload operations.
pub type Result<T> = std::result::Result<T, OffloadError>;

/// Errors surfaced by the offload runtime and the routines built on it.
#[derive(Debug, Error)]
pub enum OffloadError {
    /// Device-addressable memory could not satisfy an allocation.
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
        /// Bytes still available on the device at the time of the request.
        available: usize,
    },

    /// An argument was outside the accepted domain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A configuration value was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The device refused to schedule a kernel.
    #[error("Kernel launch failed: {0}")]
    LaunchFailed(String),

    /// A kernel aborted while running on the device.
    #[error("Kernel fault: {0}")]
    KernelFault(String),

    /// A bounded wait expired before the device finished.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// An operation was attempted in the wrong lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The requested backend is not available in this build or on this host.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend-specific failure.
    #[error("Backend error: {0}")]
    BackendError(String),
}

impl OffloadError {
    /// Whether this error came from a bounded wait expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, OffloadError::Timeout(_))
    }

    /// Whether this error came from an allocation that could not be satisfied.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, OffloadError::OutOfMemory { .. })
    }
}
