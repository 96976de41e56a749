//! Docker container backend.
//!
//! One container per instance, named `kiosk-<instanceId>` and tagged with
//! `kiosk.*` labels so leftovers can be found after a restart.

use crate::error::DockerError;
use crate::hardware;
use async_trait::async_trait;
use bollard::models::{
    ContainerCreateBody, ContainerState, ContainerStateStatusEnum, HealthStatusEnum, HostConfig,
    PortBinding,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures::TryStreamExt;
use kiosk_core::{
    BackendError, ContainerBackend, HealthStatus, InstanceId, InterfaceKind, SandboxRef,
    SandboxSpec,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Label marking containers owned by this system.
pub const LABEL_INSTANCE: &str = "kiosk.instance";
/// Label carrying the instance id.
pub const LABEL_INSTANCE_ID: &str = "kiosk.instance-id";
/// Label carrying the profile label.
pub const LABEL_PROFILE: &str = "kiosk.profile";
/// Label carrying the interface kind.
pub const LABEL_INTERFACE: &str = "kiosk.interface";
/// Label carrying the creation time (RFC 3339).
pub const LABEL_CREATED_AT: &str = "kiosk.created-at";

/// Configuration for [`DockerBackend`].
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Image serving a browser desktop on [`desktop_port`](Self::desktop_port).
    pub desktop_image: String,
    /// Image serving a browser terminal on [`terminal_port`](Self::terminal_port).
    pub terminal_image: String,
    /// Web port of the desktop image (default: 80).
    pub desktop_port: u16,
    /// Raw VNC port of the desktop image (default: 5900), published at
    /// the assigned port + [`vnc_port_offset`](Self::vnc_port_offset).
    pub vnc_port: u16,
    /// Offset of the published VNC port (default: 1000).
    pub vnc_port_offset: u16,
    /// Web port of the terminal image (default: 7681).
    pub terminal_port: u16,
    /// Host address the ports are bound to (default: 127.0.0.1).
    pub bind_address: String,
    /// Memory limit applied to every sandbox, whatever its profile
    /// (default: 2 GiB).
    pub memory_bytes: i64,
    /// Seconds a container gets to stop before it is killed (default: 5).
    pub stop_grace_secs: i32,
    /// Pull images that are not present locally (default: true).
    pub pull_images: bool,
    /// Directory for hardware descriptions.
    pub state_dir: PathBuf,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            desktop_image: "dorowu/ubuntu-desktop-lxde-vnc:latest".into(),
            terminal_image: "tsl0922/ttyd:latest".into(),
            desktop_port: 80,
            vnc_port: 5900,
            vnc_port_offset: 1000,
            terminal_port: 7681,
            bind_address: "127.0.0.1".into(),
            memory_bytes: 2 * 1024 * 1024 * 1024,
            stop_grace_secs: 5,
            pull_images: true,
            state_dir: PathBuf::from("/var/lib/kiosk"),
        }
    }
}

impl DockerConfig {
    /// Image for the given interface.
    pub fn image_for(&self, interface: InterfaceKind) -> &str {
        match interface {
            InterfaceKind::Desktop => &self.desktop_image,
            InterfaceKind::Terminal => &self.terminal_image,
        }
    }

    /// Container name of an instance.
    pub fn container_name(&self, id: InstanceId) -> String {
        format!("kiosk-{id}")
    }

    /// Container ports published for `spec`, mapped to host ports.
    pub fn port_map(&self, spec: &SandboxSpec) -> Vec<(u16, u16)> {
        match spec.interface {
            InterfaceKind::Desktop => {
                let mut ports = vec![(self.desktop_port, spec.port)];
                match spec.port.checked_add(self.vnc_port_offset) {
                    Some(vnc) => ports.push((self.vnc_port, vnc)),
                    None => tracing::warn!(port = spec.port, "No room for the VNC port, not publishing it"),
                }
                ports
            }
            InterfaceKind::Terminal => vec![(self.terminal_port, spec.port)],
        }
    }

    /// Container creation body for `spec`.
    pub fn container_body(&self, spec: &SandboxSpec, hardware_file: &Path) -> ContainerCreateBody {
        let labels = HashMap::from([
            (LABEL_INSTANCE.to_string(), "true".to_string()),
            (LABEL_INSTANCE_ID.to_string(), spec.instance_id.to_string()),
            (LABEL_PROFILE.to_string(), spec.profile.clone()),
            (LABEL_INTERFACE.to_string(), spec.interface.to_string()),
            (LABEL_CREATED_AT.to_string(), chrono::Utc::now().to_rfc3339()),
        ]);

        let port_bindings = self
            .port_map(spec)
            .into_iter()
            .map(|(container, host)| {
                (
                    format!("{container}/tcp"),
                    Some(vec![PortBinding {
                        host_ip: Some(self.bind_address.clone()),
                        host_port: Some(host.to_string()),
                    }]),
                )
            })
            .collect();

        let env = match spec.interface {
            InterfaceKind::Desktop => vec!["RESOLUTION=1024x768".to_string(), "USER=ubuntu".to_string()],
            InterfaceKind::Terminal => Vec::new(),
        };

        ContainerCreateBody {
            image: Some(self.image_for(spec.interface).to_string()),
            labels: Some(labels),
            env: if env.is_empty() { None } else { Some(env) },
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                binds: Some(vec![format!(
                    "{}:{}:ro",
                    hardware_file.display(),
                    hardware::MOUNT_PATH
                )]),
                memory: Some(self.memory_bytes),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        }
    }
}

/// Map Docker's view of a container to a health probe result.
///
/// Images with a health check report it directly; without one, a running
/// container counts as healthy.
pub fn health_from_state(state: Option<&ContainerState>) -> HealthStatus {
    let Some(state) = state else {
        return HealthStatus::Unknown;
    };

    if let Some(status) = state.health.as_ref().and_then(|h| h.status.as_ref()) {
        match status {
            HealthStatusEnum::HEALTHY => return HealthStatus::Healthy,
            HealthStatusEnum::UNHEALTHY => return HealthStatus::Unhealthy,
            HealthStatusEnum::STARTING => return HealthStatus::Unknown,
            // No health check configured.
            _ => {}
        }
    }

    match state.status {
        Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD) => HealthStatus::Unhealthy,
        _ if state.running == Some(true) => HealthStatus::Healthy,
        _ => HealthStatus::Unknown,
    }
}

/// Container backend talking to the local Docker daemon.
pub struct DockerBackend {
    docker: Docker,
    config: DockerConfig,
}

impl DockerBackend {
    /// Connect to the daemon using the local defaults (`DOCKER_HOST` or
    /// the default socket).
    pub fn connect(config: DockerConfig) -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| DockerError::Connect(e.to_string()))?;
        Ok(Self { docker, config })
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DockerError::Connect(e.to_string()))?;
        Ok(())
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    async fn ensure_image(&self, image: &str) -> Result<(), DockerError> {
        if !self.config.pull_images || self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let (from_image, tag) = split_image_ref(image);
        tracing::info!(image, "Pulling image");
        let start = std::time::Instant::now();
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(DockerError::api("pull_image", image))?;
        tracing::info!(image, elapsed_ms = start.elapsed().as_millis() as u64, "Image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &SandboxSpec) -> Result<SandboxRef, DockerError> {
        let name = self.config.container_name(spec.instance_id);
        let image = self.config.image_for(spec.interface);
        self.ensure_image(image).await?;

        let hardware_file =
            hardware::write_description(&self.config.state_dir, &name, &spec.profile).await?;
        let body = self.config.container_body(spec, &hardware_file);

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await;
        if let Err(e) = created {
            hardware::remove_description(&self.config.state_dir, &name).await;
            return Err(DockerError::api("create_container", &name)(e));
        }

        tracing::info!(
            instance_id = %spec.instance_id,
            container = %name,
            image,
            port = spec.port,
            profile = %spec.profile,
            "Container created"
        );
        Ok(SandboxRef::new(name))
    }

    async fn remove_container(&self, name: &str) -> Result<(), DockerError> {
        // Stopping an already stopped container is fine; removal below is
        // forced anyway.
        let _ = self
            .docker
            .stop_container(
                name,
                Some(
                    StopContainerOptionsBuilder::new()
                        .t(self.config.stop_grace_secs)
                        .build(),
                ),
            )
            .await;

        let removed = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
            .map_err(DockerError::api("remove_container", name));
        hardware::remove_description(&self.config.state_dir, name).await;
        removed?;

        tracing::info!(container = name, "Container removed");
        Ok(())
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxRef, BackendError> {
        Ok(self.create_container(spec).await?)
    }

    async fn start(&self, sandbox: &SandboxRef) -> Result<(), BackendError> {
        self.docker
            .start_container(sandbox.as_str(), None::<StartContainerOptions>)
            .await
            .map_err(DockerError::api("start_container", sandbox.as_str()))?;
        tracing::debug!(container = %sandbox, "Container started");
        Ok(())
    }

    async fn health_status(&self, sandbox: &SandboxRef) -> Result<HealthStatus, BackendError> {
        let inspect = self
            .docker
            .inspect_container(sandbox.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(DockerError::api("inspect_container", sandbox.as_str()))?;
        Ok(health_from_state(inspect.state.as_ref()))
    }

    async fn is_alive(&self, sandbox: &SandboxRef) -> Result<bool, BackendError> {
        match self
            .docker
            .inspect_container(sandbox.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(DockerError::api("inspect_container", sandbox.as_str()))
        {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, sandbox: &SandboxRef) -> Result<(), BackendError> {
        Ok(self.remove_container(sandbox.as_str()).await?)
    }

    async fn list_tagged(&self) -> Result<Vec<SandboxRef>, BackendError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{LABEL_INSTANCE}=true")],
        )]);
        let containers = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(DockerError::api("list_containers", LABEL_INSTANCE))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string());
                name.or(summary.id).map(SandboxRef::new)
            })
            .collect())
    }
}

/// Split an image reference into repository and tag.
///
/// A colon followed by a path is a registry port, not a tag.
fn split_image_ref(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository, tag),
        _ => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::Health;

    fn spec(interface: InterfaceKind, port: u16) -> SandboxSpec {
        SandboxSpec {
            instance_id: InstanceId::new(),
            port,
            profile: "24v64g".into(),
            interface,
        }
    }

    #[test]
    fn test_desktop_publishes_web_and_vnc() {
        let config = DockerConfig::default();
        assert_eq!(
            config.port_map(&spec(InterfaceKind::Desktop, 6080)),
            vec![(80, 6080), (5900, 7080)]
        );
        assert_eq!(
            config.port_map(&spec(InterfaceKind::Terminal, 6081)),
            vec![(7681, 6081)]
        );
        // No VNC port past the end of the port range.
        assert_eq!(
            config.port_map(&spec(InterfaceKind::Desktop, u16::MAX - 10)),
            vec![(80, u16::MAX - 10)]
        );
    }

    #[test]
    fn test_split_image_ref() {
        assert_eq!(split_image_ref("ubuntu:22.04"), ("ubuntu", "22.04"));
        assert_eq!(split_image_ref("ubuntu"), ("ubuntu", "latest"));
        assert_eq!(
            split_image_ref("localhost:5000/kiosk/desktop"),
            ("localhost:5000/kiosk/desktop", "latest")
        );
        assert_eq!(
            split_image_ref("localhost:5000/kiosk/desktop:v2"),
            ("localhost:5000/kiosk/desktop", "v2")
        );
    }

    #[test]
    fn test_container_body() {
        let config = DockerConfig::default();
        let spec = spec(InterfaceKind::Desktop, 6080);
        let body = config.container_body(&spec, Path::new("/var/lib/kiosk/hardware/kiosk-x.json"));

        assert_eq!(body.image.as_deref(), Some("dorowu/ubuntu-desktop-lxde-vnc:latest"));

        let labels = body.labels.unwrap();
        assert_eq!(labels[LABEL_INSTANCE], "true");
        assert_eq!(labels[LABEL_INSTANCE_ID], spec.instance_id.to_string());
        assert_eq!(labels[LABEL_PROFILE], "24v64g");
        assert_eq!(labels[LABEL_INTERFACE], "desktop");

        let host = body.host_config.unwrap();
        assert_eq!(host.memory, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(
            host.binds.unwrap(),
            vec!["/var/lib/kiosk/hardware/kiosk-x.json:/etc/fake.json:ro".to_string()]
        );
        let bindings = host.port_bindings.unwrap();
        let web = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(web[0].host_port.as_deref(), Some("6080"));
        assert_eq!(web[0].host_ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_profile_does_not_change_limits() {
        let config = DockerConfig::default();
        let mut small = spec(InterfaceKind::Terminal, 6080);
        small.profile = "2v2g".into();
        let body = config.container_body(&small, Path::new("/tmp/hw.json"));
        assert_eq!(body.host_config.unwrap().memory, Some(config.memory_bytes));
        assert!(body.env.is_none());
    }

    #[test]
    fn test_container_name() {
        let config = DockerConfig::default();
        let id = InstanceId::new();
        assert_eq!(config.container_name(id), format!("kiosk-{id}"));
    }

    #[test]
    fn test_health_mapping() {
        assert_eq!(health_from_state(None), HealthStatus::Unknown);

        let running = ContainerState {
            running: Some(true),
            status: Some(ContainerStateStatusEnum::RUNNING),
            ..Default::default()
        };
        assert_eq!(health_from_state(Some(&running)), HealthStatus::Healthy);

        let starting = ContainerState {
            health: Some(Health {
                status: Some(HealthStatusEnum::STARTING),
                ..Default::default()
            }),
            ..running.clone()
        };
        assert_eq!(health_from_state(Some(&starting)), HealthStatus::Unknown);

        let unhealthy = ContainerState {
            health: Some(Health {
                status: Some(HealthStatusEnum::UNHEALTHY),
                ..Default::default()
            }),
            ..running.clone()
        };
        assert_eq!(health_from_state(Some(&unhealthy)), HealthStatus::Unhealthy);

        let exited = ContainerState {
            running: Some(false),
            status: Some(ContainerStateStatusEnum::EXITED),
            ..Default::default()
        };
        assert_eq!(health_from_state(Some(&exited)), HealthStatus::Unhealthy);

        let created = ContainerState {
            running: Some(false),
            status: Some(ContainerStateStatusEnum::CREATED),
            ..Default::default()
        };
        assert_eq!(health_from_state(Some(&created)), HealthStatus::Unknown);
    }
}
