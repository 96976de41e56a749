//! Provisioning state machine.
//!
//! One task per promoted instance drives it through
//! `creating_container → creating_tunnel → starting → ready`. Each
//! transition is a method; results are published under the state lock only
//! if the instance is still current, so a deletion that races a step never
//! sees a half-written record.

use crate::backend::{HealthStatus, SandboxRef, SandboxSpec, Tunnel};
use crate::error::{BackendError, ProvisionError};
use crate::instance::{Identity, InstanceState, ProvisionStep};
use crate::orchestrator::{Inner, Task, Teardown};
use crate::reaper;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Build the provisioning task for a freshly promoted instance.
pub(crate) fn provision(
    inner: Arc<Inner>,
    identity: Identity,
    spec: SandboxSpec,
    cancel: CancellationToken,
) -> Task {
    Box::pin(async move {
        Provisioner {
            inner,
            identity,
            spec,
            cancel,
            started: Instant::now(),
        }
        .run()
        .await
    })
}

struct Provisioner {
    inner: Arc<Inner>,
    identity: Identity,
    spec: SandboxSpec,
    cancel: CancellationToken,
    started: Instant,
}

impl Provisioner {
    async fn run(self) {
        let id = self.spec.instance_id;
        match self.drive().await {
            Ok(()) => {}
            Err(ProvisionError::Cancelled) => {
                tracing::debug!(instance_id = %id, "Provisioning cancelled");
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn drive(&self) -> Result<(), ProvisionError> {
        let containers = &self.inner.containers;

        let create = self.spawn_create().await?;
        let sandbox = self
            .step("create", ProvisionError::Container, async move {
                create.await.unwrap_or_else(|e| {
                    Err(BackendError::Failed(format!("create task failed: {e}")))
                })
            })
            .await?;
        self.ensure_current().await?;
        self.step("start", ProvisionError::Container, containers.start(&sandbox))
            .await?;

        self.advance(InstanceState::Provisioning(ProvisionStep::Tunnel))
            .await?;
        let tunnel = self
            .step(
                "tunnel",
                ProvisionError::Tunnel,
                self.inner.tunnels.open(self.spec.instance_id, self.spec.port),
            )
            .await?;
        self.publish_tunnel(tunnel).await?;

        self.wait_healthy(&sandbox).await?;
        self.mark_ready().await
    }

    /// Run one backend call, bounded by the step timeout.
    ///
    /// Cancellation is checked before the call, not during it: a call that
    /// already reached the backend is allowed to finish so its result can
    /// be cleaned up.
    async fn step<T>(
        &self,
        step: &'static str,
        wrap: fn(BackendError) -> ProvisionError,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, ProvisionError> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        tracing::debug!(instance_id = %self.spec.instance_id, step, "Provisioning step");

        let after = self.inner.config.step_timeout;
        match tokio::time::timeout(after, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(wrap(e)),
            Err(_) => Err(ProvisionError::Timeout { step, after }),
        }
    }

    async fn advance(&self, next: InstanceState) -> Result<(), ProvisionError> {
        let mut registry = self.inner.state.lock().await;
        let record = registry
            .current_mut(&self.identity, self.spec.instance_id)
            .ok_or(ProvisionError::Cancelled)?;
        debug_assert!(record.state.advances_to(next), "{} -> {}", record.state, next);
        record.state = next;
        Ok(())
    }

    /// Start the backend create in its own task.
    ///
    /// The create outlives this task if provisioning is aborted or times
    /// out; see [`create_sandbox`].
    async fn spawn_create(
        &self,
    ) -> Result<JoinHandle<Result<SandboxRef, BackendError>>, ProvisionError> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        let mut registry = self.inner.state.lock().await;
        let record = registry
            .current_mut(&self.identity, self.spec.instance_id)
            .ok_or(ProvisionError::Cancelled)?;
        record.create_in_flight = true;
        Ok(tokio::spawn(create_sandbox(
            Arc::clone(&self.inner),
            self.identity.clone(),
            self.spec.clone(),
        )))
    }

    async fn ensure_current(&self) -> Result<(), ProvisionError> {
        let registry = self.inner.state.lock().await;
        registry
            .get(&self.identity)
            .filter(|record| record.is_current(self.spec.instance_id))
            .map(|_| ())
            .ok_or(ProvisionError::Cancelled)
    }

    /// Record the tunnel and move to `starting`, or close the tunnel if the
    /// instance is gone.
    async fn publish_tunnel(&self, tunnel: Tunnel) -> Result<(), ProvisionError> {
        {
            let mut registry = self.inner.state.lock().await;
            if let Some(record) = registry.current_mut(&self.identity, self.spec.instance_id) {
                tracing::info!(
                    instance_id = %record.id,
                    public_url = %tunnel.public_url,
                    "Tunnel open"
                );
                record.tunnel = Some(tunnel.tunnel_ref);
                record.public_url = Some(tunnel.public_url);
                record.state = InstanceState::Starting;
                return Ok(());
            }
        }

        tracing::info!(instance_id = %self.spec.instance_id, tunnel = %tunnel.tunnel_ref, "Instance gone, closing its tunnel");
        if let Err(e) = self.inner.close_tunnel(&tunnel.tunnel_ref).await {
            tracing::warn!(tunnel = %tunnel.tunnel_ref, error = %e, "Failed to close orphaned tunnel");
        }
        Err(ProvisionError::Cancelled)
    }

    /// Poll the sandbox until it reports healthy.
    ///
    /// Running out of attempts is not an error: many images never report
    /// health, so the instance goes ready with a warning.
    async fn wait_healthy(&self, sandbox: &SandboxRef) -> Result<(), ProvisionError> {
        let config = &self.inner.config;
        let id = self.spec.instance_id;

        for attempt in 1..=config.health_check_attempts {
            let probe = tokio::time::timeout(
                config.step_timeout,
                self.inner.containers.health_status(sandbox),
            );
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ProvisionError::Cancelled),
                outcome = probe => outcome,
            };

            match outcome {
                Ok(Ok(HealthStatus::Healthy)) => {
                    tracing::debug!(instance_id = %id, attempt, "Sandbox healthy");
                    return Ok(());
                }
                Ok(Ok(status)) => {
                    tracing::trace!(instance_id = %id, attempt, ?status, "Sandbox not healthy yet");
                }
                Ok(Err(e)) => {
                    tracing::debug!(instance_id = %id, attempt, error = %e, "Health probe failed");
                }
                Err(_) => {
                    tracing::debug!(instance_id = %id, attempt, "Health probe timed out");
                }
            }

            if attempt < config.health_check_attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ProvisionError::Cancelled),
                    _ = tokio::time::sleep(config.health_check_interval) => {}
                }
            }
        }

        tracing::warn!(
            instance_id = %id,
            attempts = config.health_check_attempts,
            "Health check inconclusive, marking ready anyway"
        );
        Ok(())
    }

    /// Move to `ready`: start the idle clock, give the slot back and promote
    /// the next waiting request.
    async fn mark_ready(&self) -> Result<(), ProvisionError> {
        let inner = &self.inner;
        let mut registry = inner.state.lock().await;
        let record = registry
            .current_mut(&self.identity, self.spec.instance_id)
            .ok_or(ProvisionError::Cancelled)?;

        record.state = InstanceState::Ready;
        record.last_activity = Instant::now();
        record.slot = None;
        record.provisioner = None;
        tracing::info!(
            instance_id = %record.id,
            identity = %self.identity,
            public_url = record.public_url.as_deref().unwrap_or_default(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Instance ready"
        );

        reaper::spawn_idle_timer(
            Arc::clone(inner),
            self.identity.clone(),
            self.spec.instance_id,
            self.cancel.clone(),
        );
        inner.promote_locked(&mut registry);
        Ok(())
    }

    /// Record the failure and run cleanup.
    async fn fail(&self, error: ProvisionError) {
        let id = self.spec.instance_id;
        {
            let mut registry = self.inner.state.lock().await;
            let Some(record) = registry.current_mut(&self.identity, id) else {
                return;
            };
            record.state = InstanceState::Error;
            record.last_error = Some(error.to_string());
            // This task is the provisioner; cleanup must not wait for it.
            record.provisioner = None;
        }

        tracing::error!(
            instance_id = %id,
            identity = %self.identity,
            error = %error,
            "Provisioning failed"
        );
        self.inner.cleanup(&self.identity, id, Teardown::Failed).await;
    }
}

/// Run a backend create to completion and hand its sandbox over.
///
/// The sandbox goes to the instance if it is still current. Otherwise it
/// is removed, and the port held for the removed instance is released once
/// nothing can be listening on it.
async fn create_sandbox(
    inner: Arc<Inner>,
    identity: Identity,
    spec: SandboxSpec,
) -> Result<SandboxRef, BackendError> {
    let id = spec.instance_id;
    let result = inner.containers.create(&spec).await;

    {
        let mut registry = inner.state.lock().await;
        if let Some(record) = registry.current_mut(&identity, id) {
            record.create_in_flight = false;
            if let Ok(sandbox) = &result {
                record.sandbox = Some(sandbox.clone());
            }
            return result;
        }
    }

    if let Ok(sandbox) = &result {
        tracing::info!(instance_id = %id, sandbox = %sandbox, "Instance gone, removing its sandbox");
        if let Err(e) = inner.remove_sandbox(sandbox).await {
            tracing::warn!(sandbox = %sandbox, error = %e, "Failed to remove orphaned sandbox");
        }
    }

    let mut registry = inner.state.lock().await;
    match registry.get_mut(&identity).filter(|record| record.id == id) {
        // Still being torn down; finalizing releases the port.
        Some(record) => record.create_in_flight = false,
        None => {
            if registry.release_held(id) {
                tracing::debug!(instance_id = %id, port = spec.port, "Released port of abandoned create");
                inner.promote_locked(&mut registry);
            }
        }
    }
    result
}
