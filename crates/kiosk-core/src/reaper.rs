//! Background reclamation: per-instance idle timers and the periodic
//! liveness sweep.

use crate::backend::SandboxRef;
use crate::instance::{Identity, InstanceId, InstanceState};
use crate::orchestrator::{Inner, Task, Teardown};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Start the idle timer of a ready instance.
///
/// The deadline is re-read from `last_activity` every time it fires, so a
/// heartbeat simply pushes it back without touching the timer.
pub(crate) fn spawn_idle_timer(
    inner: Arc<Inner>,
    identity: Identity,
    id: InstanceId,
    cancel: CancellationToken,
) {
    tokio::spawn(idle_timer(inner, identity, id, cancel));
}

fn idle_timer(inner: Arc<Inner>, identity: Identity, id: InstanceId, cancel: CancellationToken) -> Task {
    Box::pin(async move {
        let idle_timeout = inner.config.idle_timeout;
        loop {
            let deadline = {
                let registry = inner.state.lock().await;
                match registry.get(&identity) {
                    Some(record) if record.is_current(id) && record.state == InstanceState::Ready => {
                        record.last_activity + idle_timeout
                    }
                    _ => return,
                }
            };

            if deadline <= Instant::now() {
                tracing::info!(
                    instance_id = %id,
                    identity = %identity,
                    idle_secs = idle_timeout.as_secs(),
                    "Instance idle, reclaiming"
                );
                inner.cleanup(&identity, id, Teardown::IdleExpired).await;
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    })
}

/// Run the liveness sweep every `liveness_interval` until shutdown.
pub(crate) fn spawn_liveness_loop(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(inner.config.liveness_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the startup sweep already ran.
        interval.tick().await;

        tracing::debug!(
            interval_secs = inner.config.liveness_interval.as_secs(),
            "Liveness sweep started"
        );
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    sweep_once(&inner).await;
                }
            }
        }
        tracing::debug!("Liveness sweep stopped");
    })
}

/// Check every ready instance's sandbox and clean up the dead ones.
///
/// Returns how many instances were reclaimed. A failed probe is logged and
/// the instance is left alone until the next sweep.
pub(crate) async fn sweep_once(inner: &Arc<Inner>) -> usize {
    let ready: Vec<(Identity, InstanceId, SandboxRef)> = {
        let registry = inner.state.lock().await;
        registry
            .iter()
            .filter(|r| r.state == InstanceState::Ready && !r.tearing_down)
            .filter_map(|r| Some((r.identity.clone(), r.id, r.sandbox.clone()?)))
            .collect()
    };

    let mut reclaimed = 0;
    for (identity, id, sandbox) in ready {
        let probe = tokio::time::timeout(inner.config.step_timeout, inner.containers.is_alive(&sandbox));
        match probe.await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                tracing::warn!(instance_id = %id, sandbox = %sandbox, "Sandbox is gone, reclaiming instance");
                inner.cleanup(&identity, id, Teardown::SandboxLost).await;
                reclaimed += 1;
            }
            Ok(Err(e)) => {
                tracing::warn!(instance_id = %id, sandbox = %sandbox, error = %e, "Liveness probe failed");
            }
            Err(_) => {
                tracing::warn!(instance_id = %id, sandbox = %sandbox, "Liveness probe timed out");
            }
        }
    }

    let pruned = inner
        .state
        .lock()
        .await
        .prune_tombstones(inner.config.tombstone_ttl);
    tracing::debug!(reclaimed, pruned, "Liveness sweep done");
    reclaimed
}
