//! Error types for kiosk-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for kiosk-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the orchestrator's public API.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The request was rejected at admission; nothing was mutated.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// No instance is known for the identity (or the instance id does not
    /// belong to it).
    #[error("instance not found")]
    NotFound,

    /// The orchestrator is shutting down and no longer admits instances.
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Synchronous rejection of a `request_instance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The identity already owns a non-terminal instance.
    #[error("identity already owns an instance")]
    AlreadyHasInstance,

    /// The registry is at its capacity limit.
    #[error("capacity exceeded ({capacity} instances)")]
    CapacityExceeded {
        /// Configured capacity limit.
        capacity: usize,
    },
}

/// Errors reported by container and tunnel backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The referenced resource does not exist (already gone).
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The backend could not be reached; the call may succeed if retried.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused or failed the operation.
    #[error("{0}")]
    Failed(String),

    /// The backend did not answer in time.
    #[error("backend timeout after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    /// Whether the error reports a resource that no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the call is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Why provisioning of an instance failed. Recorded as the instance's
/// `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// Creating or starting the sandbox failed.
    #[error("container provisioning failed: {0}")]
    Container(BackendError),

    /// Publishing the port through the tunnel backend failed.
    #[error("tunnel provisioning failed: {0}")]
    Tunnel(BackendError),

    /// A provisioning step exceeded the per-step timeout.
    #[error("{step} step timed out after {after:?}")]
    Timeout {
        /// Step that timed out.
        step: &'static str,
        /// Configured step timeout.
        after: Duration,
    },

    /// The instance was deleted while the step was running.
    #[error("provisioning cancelled")]
    Cancelled,
}
