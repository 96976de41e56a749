//! # kiosk-backend
//!
//! Concrete collaborators for the Kiosk orchestrator.
//!
//! - [`DockerBackend`] creates, starts, probes and removes sandbox
//!   containers through the Docker Engine API.
//! - [`CloudflaredTunnel`] publishes a local port through a `cloudflared`
//!   quick tunnel, one child process per instance.
//! - [`DirectTunnel`] hands out `http://<host>:<port>` for deployments
//!   that already sit behind a reverse proxy.
//!
//! ## Quick Start
//!
//! ```ignore
//! use kiosk_backend::{CloudflaredConfig, CloudflaredTunnel, DockerBackend, DockerConfig};
//! use kiosk_core::{Orchestrator, OrchestratorConfig, RetryPolicy, RetryingContainerBackend};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let docker = DockerBackend::connect(DockerConfig::default())?;
//! let containers = RetryingContainerBackend::new(docker, RetryPolicy::default());
//! let tunnels = CloudflaredTunnel::new(CloudflaredConfig::default())?;
//!
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(containers),
//!     Arc::new(tunnels),
//! )?;
//! orchestrator.start().await;
//! # Ok(())
//! # }
//! ```

mod docker;
mod error;
pub mod hardware;
mod tunnel;

pub use docker::{
    health_from_state, DockerBackend, DockerConfig, LABEL_CREATED_AT, LABEL_INSTANCE,
    LABEL_INSTANCE_ID, LABEL_INTERFACE, LABEL_PROFILE,
};
pub use error::{DockerError, TunnelError};
pub use hardware::{HardwareDescription, HardwareProfile};
pub use tunnel::{CloudflaredConfig, CloudflaredTunnel, DirectTunnel, OutputScanner};
