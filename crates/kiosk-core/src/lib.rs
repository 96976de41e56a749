//! # kiosk-core
//!
//! Instance lifecycle orchestration for Kiosk sandboxes.
//!
//! Hands out isolated, disposable sandboxes to anonymous identities: at
//! most one instance per identity, a fixed capacity, a bounded number of
//! instances provisioning at once, and automatic reclamation of idle or
//! dead instances.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Orchestrator                          │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  request_instance ──▶ ┌──────────────────────────────┐   │
//! │  status / heartbeat   │ Mutex<Registry>              │   │
//! │  delete               │  - identity → record         │   │
//! │                       │  - FIFO wait list            │   │
//! │                       │  - port set, tombstones      │   │
//! │                       └──────────────────────────────┘   │
//! │                          │ promote (Semaphore permit)    │
//! │                          ▼                               │
//! │  ┌─────────────────┐   ┌──────────────────────────────┐  │
//! │  │  Provisioner    │──▶│ ContainerBackend             │  │
//! │  │  (per instance) │──▶│ TunnelBackend                │  │
//! │  └─────────────────┘   └──────────────────────────────┘  │
//! │           │ ready                                        │
//! │           ▼                                              │
//! │  ┌─────────────────┐   ┌──────────────────────────────┐  │
//! │  │  Idle timer     │   │ Liveness sweep (periodic)    │  │
//! │  └─────────────────┘   └──────────────────────────────┘  │
//! │           │                       │                      │
//! │           └───────▶ cleanup ◀─────┘                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every teardown, whatever triggered it, goes through the same cleanup
//! path: cancel, close the tunnel, remove the sandbox, release port and
//! slot, drop the record, promote the next waiting request.
//!
//! ## Quick Start
//!
//! ```ignore
//! use kiosk_core::{Identity, InterfaceKind, Orchestrator, OrchestratorConfig};
//!
//! # async fn example(containers: Arc<dyn ContainerBackend>, tunnels: Arc<dyn TunnelBackend>) -> kiosk_core::Result<()> {
//! let config = OrchestratorConfig::builder()
//!     .capacity(10)
//!     .max_concurrent_provisioning(2)
//!     .build()?;
//! let orchestrator = Orchestrator::new(config, containers, tunnels)?;
//! orchestrator.start().await;
//!
//! let alice = Identity::new("alice");
//! let admission = orchestrator
//!     .request_instance(alice.clone(), "24v64g", InterfaceKind::Desktop)
//!     .await?;
//!
//! let status = orchestrator.status(&alice, admission.instance_id).await?;
//! println!("{} {:?}", status.state, status.public_url);
//!
//! orchestrator.delete(&alice).await?;
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod backend;
mod config;
mod error;
mod instance;
mod lifecycle;
mod orchestrator;
mod ports;
mod reaper;
mod registry;

pub use backend::{
    ContainerBackend, HealthStatus, RetryPolicy, RetryingContainerBackend, SandboxRef, SandboxSpec,
    Tunnel, TunnelBackend, TunnelRef,
};
pub use config::{OrchestratorConfig, OrchestratorConfigBuilder};
pub use error::{AdmissionError, BackendError, CoreError, ProvisionError, Result};
pub use instance::{
    Admission, Identity, InstanceId, InstanceState, InstanceStatus, InterfaceKind, ProvisionStep,
    QueueInfo, SystemStatus,
};
pub use orchestrator::{Orchestrator, SweepReport};
pub use ports::PortAllocator;
