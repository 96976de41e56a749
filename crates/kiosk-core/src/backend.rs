//! Collaborator interfaces: the container backend that runs sandboxes and
//! the tunnel backend that publishes them.
//!
//! Implementations live outside this crate (see `kiosk-backend`); the
//! orchestrator only ever talks to these traits, which keeps the state
//! machine testable with in-memory fakes.

use crate::error::BackendError;
use crate::instance::{InstanceId, InterfaceKind};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Opaque handle of a sandbox created by a [`ContainerBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxRef(String);

impl SandboxRef {
    /// Wrap a backend-specific identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the backend-specific identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle of a tunnel opened by a [`TunnelBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelRef(String);

impl TunnelRef {
    /// Wrap a backend-specific identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the backend-specific identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the orchestrator asks a container backend to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Instance the sandbox belongs to; used for naming and labels.
    pub instance_id: InstanceId,
    /// Host port the sandbox's web interface must be bound to.
    pub port: u16,
    /// Requested resource-class label.
    pub profile: String,
    /// Interface the sandbox serves.
    pub interface: InterfaceKind,
}

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The sandbox is serving.
    Healthy,
    /// The sandbox reports a problem.
    Unhealthy,
    /// The backend cannot tell (yet).
    Unknown,
}

/// A published endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    /// Handle used to close the tunnel.
    pub tunnel_ref: TunnelRef,
    /// Externally reachable address.
    pub public_url: String,
}

/// Creates, inspects and tears down isolated sandboxes.
#[async_trait]
pub trait ContainerBackend: Send + Sync + 'static {
    /// Create a sandbox bound to `spec.port`. The sandbox is not started.
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxRef, BackendError>;

    /// Start a created sandbox.
    async fn start(&self, sandbox: &SandboxRef) -> Result<(), BackendError>;

    /// Probe the sandbox once.
    async fn health_status(&self, sandbox: &SandboxRef) -> Result<HealthStatus, BackendError>;

    /// Whether the sandbox still exists and runs.
    async fn is_alive(&self, sandbox: &SandboxRef) -> Result<bool, BackendError>;

    /// Stop and remove the sandbox. Returns `NotFound` if it is already gone.
    async fn remove(&self, sandbox: &SandboxRef) -> Result<(), BackendError>;

    /// Every sandbox tagged as belonging to this system, running or not.
    async fn list_tagged(&self) -> Result<Vec<SandboxRef>, BackendError>;
}

/// Publishes local ports at public URLs.
#[async_trait]
pub trait TunnelBackend: Send + Sync + 'static {
    /// Publish `port` for the given instance.
    async fn open(&self, instance_id: InstanceId, port: u16) -> Result<Tunnel, BackendError>;

    /// Close a tunnel. Returns `NotFound` if it is already gone.
    async fn close(&self, tunnel: &TunnelRef) -> Result<(), BackendError>;

    /// Terminate every tunnel left over by a previous run.
    ///
    /// Returns how many were terminated.
    async fn sweep(&self) -> Result<usize, BackendError>;
}

// ============================================================================
// Retry wrapper
// ============================================================================

/// Bounded retry for transient backend errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up.
    pub async fn run<T, F, Fut>(&self, name: &'static str, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    tracing::debug!(op = name, attempt, error = %e, "Backend call failed, retrying");
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => {
                    if attempt > 1 {
                        tracing::warn!(op = name, attempts = attempt, error = %e, "Backend call failed");
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Container backend decorator that retries idempotent calls on
/// [`BackendError::Unavailable`].
///
/// `create` is passed through untouched: a half-applied create followed by
/// a retry could leave a second sandbox behind.
pub struct RetryingContainerBackend<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: ContainerBackend> RetryingContainerBackend<B> {
    /// Wrap `inner` with the given policy.
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Borrow the wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: ContainerBackend> ContainerBackend for RetryingContainerBackend<B> {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxRef, BackendError> {
        self.inner.create(spec).await
    }

    async fn start(&self, sandbox: &SandboxRef) -> Result<(), BackendError> {
        self.policy.run("start", || self.inner.start(sandbox)).await
    }

    async fn health_status(&self, sandbox: &SandboxRef) -> Result<HealthStatus, BackendError> {
        self.policy
            .run("health_status", || self.inner.health_status(sandbox))
            .await
    }

    async fn is_alive(&self, sandbox: &SandboxRef) -> Result<bool, BackendError> {
        self.policy
            .run("is_alive", || self.inner.is_alive(sandbox))
            .await
    }

    async fn remove(&self, sandbox: &SandboxRef) -> Result<(), BackendError> {
        self.policy.run("remove", || self.inner.remove(sandbox)).await
    }

    async fn list_tagged(&self) -> Result<Vec<SandboxRef>, BackendError> {
        self.policy.run("list_tagged", || self.inner.list_tagged()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Backend whose `start` fails with the scripted errors before succeeding.
    struct Flaky {
        failures: Vec<BackendError>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ContainerBackend for Flaky {
        async fn create(&self, _spec: &SandboxSpec) -> Result<SandboxRef, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Unavailable("daemon restarting".into()))
        }

        async fn start(&self, _sandbox: &SandboxRef) -> Result<(), BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.failures.get(call) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }

        async fn health_status(&self, _sandbox: &SandboxRef) -> Result<HealthStatus, BackendError> {
            Ok(HealthStatus::Healthy)
        }

        async fn is_alive(&self, _sandbox: &SandboxRef) -> Result<bool, BackendError> {
            Ok(true)
        }

        async fn remove(&self, _sandbox: &SandboxRef) -> Result<(), BackendError> {
            Ok(())
        }

        async fn list_tagged(&self) -> Result<Vec<SandboxRef>, BackendError> {
            Ok(Vec::new())
        }
    }

    fn wrap(failures: Vec<BackendError>) -> (RetryingContainerBackend<Flaky>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let backend = RetryingContainerBackend::new(
            Flaky {
                failures,
                calls: Arc::clone(&calls),
            },
            RetryPolicy {
                attempts: 3,
                interval: Duration::from_millis(10),
            },
        );
        (backend, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let (backend, calls) = wrap(vec![
            BackendError::Unavailable("socket".into()),
            BackendError::Unavailable("socket".into()),
        ]);
        let sandbox = SandboxRef::new("c1");
        assert!(backend.start(&sandbox).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let (backend, calls) = wrap(vec![BackendError::Unavailable("socket".into()); 5]);
        let sandbox = SandboxRef::new("c1");
        let result = backend.start(&sandbox).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let (backend, calls) = wrap(vec![BackendError::Failed("bad image".into())]);
        let sandbox = SandboxRef::new("c1");
        assert!(backend.start(&sandbox).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_is_not_retried() {
        let (backend, calls) = wrap(Vec::new());
        let spec = SandboxSpec {
            instance_id: InstanceId::new(),
            port: 6080,
            profile: "24v64g".into(),
            interface: InterfaceKind::Desktop,
        };
        assert!(backend.create(&spec).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
