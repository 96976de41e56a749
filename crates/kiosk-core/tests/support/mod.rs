//! In-memory backends and polling helpers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use kiosk_core::{
    BackendError, ContainerBackend, HealthStatus, Identity, InstanceId, InstanceState,
    InstanceStatus, Orchestrator, OrchestratorConfig, SandboxRef, SandboxSpec, SystemStatus,
    Tunnel, TunnelBackend, TunnelRef,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

// ============================================================================
// Container backend
// ============================================================================

#[derive(Debug, Clone)]
pub struct FakeSandbox {
    pub instance_id: InstanceId,
    pub port: u16,
    pub running: bool,
}

#[derive(Default)]
struct ContainerState {
    next: u32,
    sandboxes: HashMap<SandboxRef, FakeSandbox>,
    calls: Vec<String>,
    created_for: Vec<InstanceId>,
    fail_create: VecDeque<BackendError>,
    fail_start: VecDeque<BackendError>,
    health: Option<HealthStatus>,
    in_flight: usize,
    max_in_flight: usize,
    port_conflicts: usize,
}

/// Container backend keeping sandboxes in a map.
///
/// `hold_creates` makes every `create` block until released, which keeps
/// instances in provisioning for as long as a test needs.
pub struct FakeContainers {
    state: Mutex<ContainerState>,
    gated: AtomicBool,
    gate: Semaphore,
}

impl FakeContainers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ContainerState::default()),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    pub fn hold_creates(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Let `n` blocked (or future) creates through.
    pub fn release_creates(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn fail_next_create(&self, err: BackendError) {
        self.state.lock().unwrap().fail_create.push_back(err);
    }

    pub fn fail_next_start(&self, err: BackendError) {
        self.state.lock().unwrap().fail_start.push_back(err);
    }

    pub fn set_health(&self, health: HealthStatus) {
        self.state.lock().unwrap().health = Some(health);
    }

    /// Simulate a sandbox that died outside the orchestrator's control.
    pub fn kill(&self, sandbox: &SandboxRef) {
        if let Some(s) = self.state.lock().unwrap().sandboxes.get_mut(sandbox) {
            s.running = false;
        }
    }

    /// Add a tagged sandbox that no instance knows about.
    pub fn seed_leftover(&self, name: &str) {
        self.state.lock().unwrap().sandboxes.insert(
            SandboxRef::new(name),
            FakeSandbox {
                instance_id: InstanceId::new(),
                port: 0,
                running: true,
            },
        );
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().sandboxes.len()
    }

    pub fn sandbox_of(&self, id: InstanceId) -> Option<SandboxRef> {
        let state = self.state.lock().unwrap();
        state
            .sandboxes
            .iter()
            .find(|(_, s)| s.instance_id == id)
            .map(|(r, _)| r.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls that mention the given instance or one of its sandboxes.
    pub fn calls_for(&self, id: InstanceId) -> usize {
        let needle = id.to_string();
        self.calls().iter().filter(|c| c.contains(&needle)).count()
    }

    /// Instance ids in the order `create` was called for them.
    pub fn create_order(&self) -> Vec<InstanceId> {
        self.state.lock().unwrap().created_for.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    pub fn port_conflicts(&self) -> usize {
        self.state.lock().unwrap().port_conflicts
    }

    fn log(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ContainerBackend for FakeContainers {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxRef, BackendError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("create:{}", spec.instance_id));
            state.created_for.push(spec.instance_id);
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        if self.gated.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        if let Some(err) = state.fail_create.pop_front() {
            return Err(err);
        }
        if state.sandboxes.values().any(|s| s.port == spec.port) {
            state.port_conflicts += 1;
        }
        state.next += 1;
        let sandbox = SandboxRef::new(format!("sandbox-{}-{}", state.next, spec.instance_id));
        state.sandboxes.insert(
            sandbox.clone(),
            FakeSandbox {
                instance_id: spec.instance_id,
                port: spec.port,
                running: false,
            },
        );
        Ok(sandbox)
    }

    async fn start(&self, sandbox: &SandboxRef) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start:{sandbox}"));
        if let Some(err) = state.fail_start.pop_front() {
            return Err(err);
        }
        match state.sandboxes.get_mut(sandbox) {
            Some(s) => {
                s.running = true;
                Ok(())
            }
            None => Err(BackendError::NotFound(sandbox.to_string())),
        }
    }

    async fn health_status(&self, sandbox: &SandboxRef) -> Result<HealthStatus, BackendError> {
        let state = self.state.lock().unwrap();
        if !state.sandboxes.contains_key(sandbox) {
            return Err(BackendError::NotFound(sandbox.to_string()));
        }
        Ok(state.health.unwrap_or(HealthStatus::Healthy))
    }

    async fn is_alive(&self, sandbox: &SandboxRef) -> Result<bool, BackendError> {
        let state = self.state.lock().unwrap();
        Ok(state.sandboxes.get(sandbox).is_some_and(|s| s.running))
    }

    async fn remove(&self, sandbox: &SandboxRef) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove:{sandbox}"));
        match state.sandboxes.remove(sandbox) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(sandbox.to_string())),
        }
    }

    async fn list_tagged(&self) -> Result<Vec<SandboxRef>, BackendError> {
        self.log("list_tagged".into());
        Ok(self.state.lock().unwrap().sandboxes.keys().cloned().collect())
    }
}

// ============================================================================
// Tunnel backend
// ============================================================================

#[derive(Default)]
struct TunnelState {
    next: u32,
    open: HashMap<TunnelRef, (InstanceId, u16)>,
    fail_open: VecDeque<BackendError>,
    leftovers: usize,
    closed: usize,
}

/// Tunnel backend handing out `https://<n>.tunnel.test` addresses.
pub struct FakeTunnels {
    state: Mutex<TunnelState>,
}

impl FakeTunnels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TunnelState::default()),
        })
    }

    pub fn fail_next_open(&self, err: BackendError) {
        self.state.lock().unwrap().fail_open.push_back(err);
    }

    pub fn seed_leftovers(&self, count: usize) {
        self.state.lock().unwrap().leftovers = count;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().open.len()
    }

    pub fn closed_count(&self) -> usize {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl TunnelBackend for FakeTunnels {
    async fn open(&self, instance_id: InstanceId, port: u16) -> Result<Tunnel, BackendError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_open.pop_front() {
            return Err(err);
        }
        state.next += 1;
        let tunnel_ref = TunnelRef::new(format!("tunnel-{}", state.next));
        let public_url = format!("https://{}.tunnel.test", state.next);
        state.open.insert(tunnel_ref.clone(), (instance_id, port));
        Ok(Tunnel {
            tunnel_ref,
            public_url,
        })
    }

    async fn close(&self, tunnel: &TunnelRef) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        match state.open.remove(tunnel) {
            Some(_) => {
                state.closed += 1;
                Ok(())
            }
            None => Err(BackendError::NotFound(tunnel.to_string())),
        }
    }

    async fn sweep(&self) -> Result<usize, BackendError> {
        let mut state = self.state.lock().unwrap();
        Ok(std::mem::take(&mut state.leftovers))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Test configuration: fast health checks, manual liveness sweeps.
pub fn config(capacity: usize, ceiling: usize) -> OrchestratorConfig {
    OrchestratorConfig::builder()
        .capacity(capacity)
        .max_concurrent_provisioning(ceiling)
        .base_port(7000)
        .idle_timeout(Duration::from_secs(600))
        .liveness_interval(Duration::from_secs(3600))
        .health_check(3, Duration::from_millis(100))
        .step_timeout(Duration::from_secs(30))
        .teardown_grace(Duration::from_secs(5))
        .build()
        .expect("valid test config")
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub containers: Arc<FakeContainers>,
    pub tunnels: Arc<FakeTunnels>,
}

pub fn harness(config: OrchestratorConfig) -> Harness {
    let containers = FakeContainers::new();
    let tunnels = FakeTunnels::new();
    let orchestrator = Orchestrator::new(config, containers.clone(), tunnels.clone())
        .expect("orchestrator should build");
    Harness {
        orchestrator,
        containers,
        tunnels,
    }
}

pub fn identity(name: &str) -> Identity {
    Identity::new(name)
}

/// Poll `check` until it holds; time is paused in these tests, so the
/// sleeps only let spawned tasks run.
pub async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Poll the instance's status until it reaches `state`.
pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    identity: &Identity,
    id: InstanceId,
    state: InstanceState,
) -> InstanceStatus {
    let mut last = None;
    for _ in 0..2000 {
        match orchestrator.status(identity, id).await {
            Ok(status) if status.state == state => return status,
            other => last = Some(other),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance {id} never reached {state}, last: {last:?}");
}

/// Poll the system status until `check` holds. Does not count as activity.
pub async fn wait_for_system(
    orchestrator: &Orchestrator,
    what: &str,
    check: impl Fn(&SystemStatus) -> bool,
) -> SystemStatus {
    for _ in 0..2000 {
        let status = orchestrator.system_status().await;
        if check(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
