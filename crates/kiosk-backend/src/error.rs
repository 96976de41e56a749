//! Error types for kiosk-backend.
//!
//! Both enums are converted into [`BackendError`] at the trait boundary;
//! the orchestrator only ever sees the classified form.

use bollard::errors::Error as BollardError;
use kiosk_core::BackendError;
use std::time::Duration;
use thiserror::Error;

/// Errors from the Docker container backend.
#[derive(Debug, Error)]
pub enum DockerError {
    /// The daemon could not be reached.
    #[error("failed to connect to docker: {0}")]
    Connect(String),

    /// A Docker API call failed.
    #[error("docker {op} failed for {target}: {source}")]
    Api {
        /// API operation name.
        op: &'static str,
        /// Container or image the call was about.
        target: String,
        #[source]
        source: BollardError,
    },

    /// Writing the hardware description failed.
    #[error("failed to write hardware description: {0}")]
    Hardware(#[from] std::io::Error),
}

impl DockerError {
    pub(crate) fn api<'a>(op: &'static str, target: &'a str) -> impl FnOnce(BollardError) -> Self + 'a {
        move |source| Self::Api {
            op,
            target: target.to_string(),
            source,
        }
    }

    /// Whether the daemon answered 404.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Api {
                source: BollardError::DockerResponseServerError { status_code: 404, .. },
                ..
            }
        )
    }

    fn is_connection(&self) -> bool {
        match self {
            Self::Connect(_) => true,
            Self::Api { source, .. } => matches!(
                source,
                BollardError::IOError { .. }
                    | BollardError::RequestTimeoutError
                    | BollardError::SocketNotFoundError(_)
            ),
            Self::Hardware(_) => false,
        }
    }
}

impl From<DockerError> for BackendError {
    fn from(err: DockerError) -> Self {
        if err.is_not_found() {
            let target = match &err {
                DockerError::Api { target, .. } => target.clone(),
                _ => err.to_string(),
            };
            BackendError::NotFound(target)
        } else if err.is_connection() {
            BackendError::Unavailable(err.to_string())
        } else {
            BackendError::Failed(err.to_string())
        }
    }
}

/// Errors from the tunnel backends.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The tunnel binary could not be started.
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        /// Binary that was executed.
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The tunnel process reported a fatal error.
    #[error("tunnel refused: {0}")]
    Refused(String),

    /// The tunnel process exited before publishing a URL.
    #[error("tunnel process exited before publishing a URL ({0})")]
    Exited(String),

    /// No URL was published in time.
    #[error("no tunnel URL within {0:?}")]
    UrlTimeout(Duration),

    /// The tunnel is not tracked (already closed).
    #[error("unknown tunnel {0}")]
    Unknown(String),

    /// The output pattern did not compile.
    #[error("invalid output pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Pid file or signal handling failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<TunnelError> for BackendError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Unknown(tunnel) => BackendError::NotFound(tunnel),
            TunnelError::Spawn { .. } => BackendError::Unavailable(err.to_string()),
            TunnelError::UrlTimeout(after) => BackendError::Timeout(after),
            other => BackendError::Failed(other.to_string()),
        }
    }
}
