//! The orchestrator: admission, FIFO promotion, the shared cleanup path and
//! the process-level sweeps.
//!
//! # Locking
//!
//! Registry, wait list, port set and slot bookkeeping live behind one
//! async mutex. Every check-and-mutate happens in a single critical
//! section that never awaits a backend; backend calls run in spawned
//! tasks and only re-enter the lock to publish their results.

use crate::backend::{ContainerBackend, SandboxRef, SandboxSpec, TunnelBackend, TunnelRef};
use crate::config::OrchestratorConfig;
use crate::error::{AdmissionError, BackendError, CoreError, Result};
use crate::instance::{
    Admission, Identity, InstanceId, InstanceState, InstanceStatus, InterfaceKind, ProvisionStep,
    SystemStatus,
};
use crate::lifecycle;
use crate::reaper;
use crate::registry::{InstanceRecord, QueueEntry, Registry};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Boxed task body. Spawned tasks re-enter the cleanup path, so their
/// futures are boxed to keep the types finite.
pub(crate) type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Why an instance is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Explicit deletion by the owner.
    Deleted,
    /// No heartbeat or poll within the idle window.
    IdleExpired,
    /// The liveness sweep found the sandbox gone.
    SandboxLost,
    /// A provisioning step failed.
    Failed,
    /// Process shutdown.
    Shutdown,
}

impl Teardown {
    fn final_state(self) -> InstanceState {
        match self {
            Self::Failed => InstanceState::Error,
            _ => InstanceState::Deleted,
        }
    }
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deleted => "deleted",
            Self::IdleExpired => "idle",
            Self::SandboxLost => "sandbox lost",
            Self::Failed => "provisioning failed",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Resources left over by a previous run and removed at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sandboxes stopped and removed.
    pub sandboxes: usize,
    /// Tunnel processes terminated.
    pub tunnels: usize,
}

pub(crate) struct Inner {
    pub config: OrchestratorConfig,
    pub state: Mutex<Registry>,
    /// Provisioning slots; one permit per concurrently provisioning instance.
    pub slots: Arc<Semaphore>,
    pub containers: Arc<dyn ContainerBackend>,
    pub tunnels: Arc<dyn TunnelBackend>,
    /// Parent of every per-instance token.
    pub shutdown: CancellationToken,
}

/// Brokers sandboxes to identities: one instance per identity, bounded
/// capacity, bounded concurrent provisioning, idle eviction.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator over the given backends.
    ///
    /// Call [`start()`](Self::start) before handing it to the request layer.
    pub fn new(
        config: OrchestratorConfig,
        containers: Arc<dyn ContainerBackend>,
        tunnels: Arc<dyn TunnelBackend>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            capacity = config.capacity,
            max_concurrent_provisioning = config.max_concurrent_provisioning,
            base_port = config.base_port,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Creating orchestrator"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Registry::new(config.base_port)),
                slots: Arc::new(Semaphore::new(config.max_concurrent_provisioning)),
                containers,
                tunnels,
                shutdown: CancellationToken::new(),
                config,
            }),
        })
    }

    /// Get the orchestrator configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Run the startup sweep, then start the periodic liveness sweep.
    pub async fn start(&self) -> SweepReport {
        let report = self.startup_sweep().await;
        reaper::spawn_liveness_loop(Arc::clone(&self.inner));
        report
    }

    /// Remove every tagged sandbox and every tracked tunnel left over by a
    /// previous run, so that backend reality matches the empty registry.
    pub async fn startup_sweep(&self) -> SweepReport {
        let inner = &self.inner;
        let mut report = SweepReport::default();

        match inner.containers.list_tagged().await {
            Ok(leftovers) => {
                if !leftovers.is_empty() {
                    tracing::info!(count = leftovers.len(), "Removing leftover sandboxes");
                }
                for sandbox in leftovers {
                    match inner.remove_sandbox(&sandbox).await {
                        Ok(()) => report.sandboxes += 1,
                        Err(e) => {
                            tracing::warn!(sandbox = %sandbox, error = %e, "Failed to remove leftover sandbox")
                        }
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to list leftover sandboxes"),
        }

        match inner.tunnels.sweep().await {
            Ok(count) => report.tunnels = count,
            Err(e) => tracing::error!(error = %e, "Failed to sweep leftover tunnels"),
        }

        tracing::info!(
            sandboxes = report.sandboxes,
            tunnels = report.tunnels,
            "Startup sweep complete"
        );
        report
    }

    /// Admit a new instance for `identity`.
    ///
    /// Starts provisioning right away when a slot is free, otherwise queues
    /// the request behind earlier ones.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::AlreadyHasInstance`] if the identity already owns
    /// an instance, [`AdmissionError::CapacityExceeded`] if the registry is
    /// full. Rejections do not change any state.
    pub async fn request_instance(
        &self,
        identity: Identity,
        profile: impl Into<String>,
        interface: InterfaceKind,
    ) -> Result<Admission> {
        let inner = &self.inner;
        let profile = profile.into();
        let mut registry = inner.state.lock().await;

        if inner.shutdown.is_cancelled() {
            return Err(CoreError::ShuttingDown);
        }
        if registry.contains(&identity) {
            tracing::debug!(identity = %identity, "Rejected: identity already has an instance");
            return Err(AdmissionError::AlreadyHasInstance.into());
        }
        if registry.len() >= inner.config.capacity {
            tracing::info!(
                identity = %identity,
                capacity = inner.config.capacity,
                "Rejected: capacity exceeded"
            );
            return Err(AdmissionError::CapacityExceeded {
                capacity: inner.config.capacity,
            }
            .into());
        }

        let record = InstanceRecord::new(
            identity.clone(),
            profile.clone(),
            interface,
            inner.shutdown.child_token(),
        );
        let id = record.id;
        registry.insert(record);
        let position = registry.enqueue(QueueEntry {
            identity: identity.clone(),
            instance_id: id,
            profile: profile.clone(),
            interface,
            enqueued_at: Instant::now(),
        });
        tracing::info!(
            instance_id = %id,
            identity = %identity,
            profile = %profile,
            interface = %interface,
            position,
            "Instance admitted"
        );

        // Promotion takes the head of the list, so a request only jumps
        // straight to provisioning when nobody is waiting ahead of it.
        inner.promote_locked(&mut registry);

        let state = registry
            .get(&identity)
            .map(|record| record.state)
            .unwrap_or(InstanceState::Error);
        let queue = registry.queue_info(id, inner.config.estimated_seconds_per_slot);
        if let Some(queue) = queue {
            tracing::info!(
                instance_id = %id,
                position = queue.position,
                estimated_wait_seconds = queue.estimated_wait_seconds,
                "Instance queued"
            );
        }

        Ok(Admission {
            instance_id: id,
            state,
            queue,
        })
    }

    /// Status of instance `id` owned by `identity`.
    ///
    /// Counts as activity for the idle timer. Instances that already ended
    /// stay visible (state `error` or `deleted`, with `last_error`) until
    /// the tombstone expires or the identity requests again.
    pub async fn status(&self, identity: &Identity, id: InstanceId) -> Result<InstanceStatus> {
        let inner = &self.inner;
        let mut registry = inner.state.lock().await;

        if let Some(record) = registry.get_mut(identity).filter(|r| r.id == id) {
            if !record.tearing_down {
                record.last_activity = Instant::now();
            }
            let status = record.status(None);
            let queue = registry.queue_info(id, inner.config.estimated_seconds_per_slot);
            return Ok(InstanceStatus { queue, ..status });
        }

        registry
            .tombstone(identity)
            .filter(|tombstone| tombstone.status.instance_id == id)
            .map(|tombstone| tombstone.status.clone())
            .ok_or(CoreError::NotFound)
    }

    /// Status of whatever live instance `identity` owns, if any.
    ///
    /// Counts as activity for the idle timer.
    pub async fn user_status(&self, identity: &Identity) -> Option<InstanceStatus> {
        let inner = &self.inner;
        let mut registry = inner.state.lock().await;
        let record = registry.get_mut(identity).filter(|r| !r.tearing_down)?;
        record.last_activity = Instant::now();
        let status = record.status(None);
        let queue = registry.queue_info(status.instance_id, inner.config.estimated_seconds_per_slot);
        Some(InstanceStatus { queue, ..status })
    }

    /// Reset the idle timer of the identity's instance.
    pub async fn heartbeat(&self, identity: &Identity) -> Result<()> {
        let mut registry = self.inner.state.lock().await;
        let record = registry
            .get_mut(identity)
            .filter(|r| !r.tearing_down)
            .ok_or(CoreError::NotFound)?;
        record.last_activity = Instant::now();
        tracing::trace!(instance_id = %record.id, identity = %identity, "Heartbeat");
        Ok(())
    }

    /// Delete the identity's instance, whatever state it is in.
    ///
    /// Returns once teardown finished; in-flight provisioning is given
    /// `teardown_grace` to wind down before it is aborted.
    pub async fn delete(&self, identity: &Identity) -> Result<()> {
        let id = {
            let registry = self.inner.state.lock().await;
            registry
                .get(identity)
                .filter(|r| !r.tearing_down)
                .map(|r| r.id)
                .ok_or(CoreError::NotFound)?
        };
        tracing::info!(instance_id = %id, identity = %identity, "Deleting instance");
        self.inner.cleanup(identity, id, Teardown::Deleted).await;
        Ok(())
    }

    /// Aggregate counters.
    pub async fn system_status(&self) -> SystemStatus {
        let inner = &self.inner;
        let registry = inner.state.lock().await;
        let mut status = SystemStatus {
            active_count: 0,
            queued_count: registry.queue_len(),
            provisioning_count: 0,
            ports_in_use: registry.ports_in_use(),
            capacity: inner.config.capacity,
            concurrency_ceiling: inner.config.max_concurrent_provisioning,
        };
        for record in registry.iter() {
            if record.slot.is_some() {
                status.provisioning_count += 1;
            }
            if record.state == InstanceState::Ready && !record.tearing_down {
                status.active_count += 1;
            }
        }
        status
    }

    /// Run one liveness sweep now. The background loop started by
    /// [`start()`](Self::start) calls this every `liveness_interval`.
    pub async fn sweep_liveness(&self) -> usize {
        reaper::sweep_once(&self.inner).await
    }

    /// Stop accepting requests, cancel all queued and in-flight work and
    /// tear down every instance.
    pub async fn shutdown(&self) {
        let identities: Vec<(Identity, InstanceId)> = {
            let registry = self.inner.state.lock().await;
            self.inner.shutdown.cancel();
            registry
                .iter()
                .filter(|r| !r.tearing_down)
                .map(|r| (r.identity.clone(), r.id))
                .collect()
        };
        tracing::info!(count = identities.len(), "Shutting down, cleaning up instances");

        let mut cleanups = JoinSet::new();
        for (identity, id) in identities {
            let inner = Arc::clone(&self.inner);
            cleanups.spawn(async move { inner.cleanup(&identity, id, Teardown::Shutdown).await });
        }
        while let Some(result) = cleanups.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Cleanup task panicked during shutdown");
            }
        }
        tracing::info!("Orchestrator shutdown complete");
    }
}

impl Inner {
    /// Move waiting requests into provisioning while slots are free.
    ///
    /// Strict FIFO: the head of the wait list is always promoted first.
    pub(crate) fn promote_locked(self: &Arc<Self>, registry: &mut Registry) {
        if self.shutdown.is_cancelled() {
            return;
        }

        while registry.queue_len() > 0 {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                tracing::trace!(queued = registry.queue_len(), "No free provisioning slot");
                break;
            };
            let Some(entry) = registry.pop_queue() else {
                break;
            };
            if !registry
                .get(&entry.identity)
                .is_some_and(|r| r.is_current(entry.instance_id))
            {
                continue;
            }
            let Some(port) = registry.allocate_port() else {
                // Capacity validation keeps enough ports around; this is
                // only reachable with a broken configuration.
                tracing::error!(instance_id = %entry.instance_id, "No free port for instance");
                drop(permit);
                if let Some(record) = registry.current_mut(&entry.identity, entry.instance_id) {
                    record.state = InstanceState::Error;
                    record.last_error = Some("no free port".into());
                }
                self.finalize_locked(registry, &entry.identity, entry.instance_id);
                continue;
            };
            let Some(record) = registry.current_mut(&entry.identity, entry.instance_id) else {
                continue;
            };
            record.state = InstanceState::Provisioning(ProvisionStep::Container);
            record.port = Some(port);
            record.slot = Some(permit);

            let spec = SandboxSpec {
                instance_id: entry.instance_id,
                port,
                profile: entry.profile,
                interface: entry.interface,
            };
            let task = lifecycle::provision(
                Arc::clone(self),
                entry.identity.clone(),
                spec,
                record.cancel.clone(),
            );
            record.provisioner = Some(tokio::spawn(task));

            tracing::info!(
                instance_id = %entry.instance_id,
                identity = %entry.identity,
                port,
                waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                "Provisioning started"
            );
        }
    }

    /// The single teardown path. Idempotent: only the first call for a
    /// given instance does anything.
    ///
    /// Order: claim the record and cancel its timer and provisioning task,
    /// let in-flight provisioning wind down (bounded), close the tunnel,
    /// remove the sandbox, then release port and slot, drop the record and
    /// promote the next waiting request. Failures are logged and never stop
    /// later steps.
    pub(crate) async fn cleanup(self: &Arc<Self>, identity: &Identity, id: InstanceId, reason: Teardown) {
        let start = std::time::Instant::now();

        // Claim the record.
        let (sandbox, tunnel, provisioner) = {
            let mut registry = self.state.lock().await;
            let Some(record) = registry.current_mut(identity, id) else {
                tracing::trace!(instance_id = %id, "Cleanup already done or in progress");
                return;
            };
            record.tearing_down = true;
            record.state = reason.final_state();
            record.cancel.cancel();

            let was_queued = record.slot.is_none() && record.port.is_none();
            let claimed = (
                record.sandbox.clone(),
                record.tunnel.clone(),
                record.provisioner.take(),
            );

            // Nothing was created for a queued instance: no backend calls,
            // no slot to give back.
            if was_queued {
                registry.remove_queued(id);
                tracing::info!(instance_id = %id, identity = %identity, %reason, "Queued instance removed");
                self.finalize_locked(&mut registry, identity, id);
                return;
            }
            claimed
        };

        tracing::info!(instance_id = %id, identity = %identity, %reason, "Cleaning up instance");

        if let Some(handle) = provisioner {
            self.wind_down(id, handle).await;
        }

        if let Some(tunnel) = &tunnel {
            if let Err(e) = self.close_tunnel(tunnel).await {
                tracing::warn!(instance_id = %id, tunnel = %tunnel, error = %e, "Failed to close tunnel");
            }
        }

        if let Some(sandbox) = &sandbox {
            if let Err(e) = self.remove_sandbox(sandbox).await {
                tracing::warn!(instance_id = %id, sandbox = %sandbox, error = %e, "Failed to remove sandbox");
            }
        }

        let mut registry = self.state.lock().await;
        self.finalize_locked(&mut registry, identity, id);
        tracing::info!(
            instance_id = %id,
            identity = %identity,
            %reason,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Instance cleaned up"
        );
    }

    /// Drop the record, release its port and slot, remember its outcome and
    /// promote waiting requests.
    fn finalize_locked(self: &Arc<Self>, registry: &mut Registry, identity: &Identity, id: InstanceId) {
        let matches = registry.get(identity).is_some_and(|r| r.id == id);
        if matches {
            if let Some(record) = registry.remove(identity) {
                record.cancel.cancel();
                let status = record.status(None);
                registry.bury(identity.clone(), status);
            }
        }
        self.promote_locked(registry);
    }

    /// Wait for an in-flight provisioning task to notice cancellation,
    /// aborting it after the grace period.
    async fn wind_down(&self, id: InstanceId, mut handle: JoinHandle<()>) {
        match tokio::time::timeout(self.config.teardown_grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => tracing::error!(instance_id = %id, error = %e, "Provisioning task panicked"),
            Err(_) => {
                tracing::warn!(
                    instance_id = %id,
                    grace_secs = self.config.teardown_grace.as_secs(),
                    "Provisioning did not stop in time, aborting"
                );
                handle.abort();
            }
        }
    }

    /// Best-effort sandbox teardown. A sandbox that is already gone counts
    /// as removed.
    pub(crate) async fn remove_sandbox(&self, sandbox: &SandboxRef) -> std::result::Result<(), BackendError> {
        let grace = self.config.teardown_grace;
        match tokio::time::timeout(grace, self.containers.remove(sandbox)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_not_found() => {
                tracing::debug!(sandbox = %sandbox, "Sandbox already gone");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::Timeout(grace)),
        }
    }

    /// Best-effort tunnel teardown. A tunnel that is already gone counts as
    /// closed.
    pub(crate) async fn close_tunnel(&self, tunnel: &TunnelRef) -> std::result::Result<(), BackendError> {
        let grace = self.config.teardown_grace;
        match tokio::time::timeout(grace, self.tunnels.close(tunnel)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_not_found() => {
                tracing::debug!(tunnel = %tunnel, "Tunnel already gone");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::Timeout(grace)),
        }
    }
}
