//! Configuration for the Kiosk server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use kiosk_backend::{CloudflaredConfig, DockerConfig};
use kiosk_core::{CoreError, OrchestratorConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How sandbox ports are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelMode {
    /// `cloudflared` quick tunnels (default).
    #[default]
    Cloudflared,
    /// `http://<public host>:<port>`, no tunnel process.
    Direct,
}

impl TunnelMode {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "direct" | "none" | "local" => Self::Direct,
            _ => Self::Cloudflared,
        }
    }
}

/// Configuration for the Kiosk server.
#[derive(Debug, Clone)]
pub struct KioskConfig {
    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Maximum number of tracked instances (default: 10).
    pub capacity: usize,

    /// Maximum concurrent provisioning (default: 2).
    pub max_concurrent: usize,

    /// Idle window before a ready instance is reclaimed (default: 10 minutes).
    pub idle_timeout: Duration,

    /// First local port handed to sandboxes (default: 6080).
    pub base_port: u16,

    /// Image for desktop sandboxes.
    pub desktop_image: String,

    /// Image for terminal sandboxes.
    pub terminal_image: String,

    /// Tunnel mode (default: cloudflared).
    pub tunnel_mode: TunnelMode,

    /// Path to the `cloudflared` binary.
    pub cloudflared_path: PathBuf,

    /// Directory for pid files and hardware descriptions.
    pub state_dir: PathBuf,

    /// Host name used in direct mode URLs.
    pub public_host: String,
}

impl Default for KioskConfig {
    fn default() -> Self {
        let docker = DockerConfig::default();
        let core = OrchestratorConfig::default();
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 3000),
            capacity: core.capacity,
            max_concurrent: core.max_concurrent_provisioning,
            idle_timeout: core.idle_timeout,
            base_port: core.base_port,
            desktop_image: docker.desktop_image,
            terminal_image: docker.terminal_image,
            tunnel_mode: TunnelMode::Cloudflared,
            cloudflared_path: PathBuf::from("cloudflared"),
            state_dir: docker.state_dir,
            public_host: "localhost".into(),
        }
    }
}

impl KioskConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KIOSK_HTTP_HOST` | `0.0.0.0` |
    /// | `KIOSK_HTTP_PORT` | `3000` |
    /// | `KIOSK_CAPACITY` | `10` |
    /// | `KIOSK_MAX_CONCURRENT` | `2` |
    /// | `KIOSK_IDLE_SECS` | `600` |
    /// | `KIOSK_BASE_PORT` | `6080` |
    /// | `KIOSK_DESKTOP_IMAGE` | `dorowu/ubuntu-desktop-lxde-vnc:latest` |
    /// | `KIOSK_TERMINAL_IMAGE` | `tsl0922/ttyd:latest` |
    /// | `KIOSK_TUNNEL` | `cloudflared` (cloudflared, direct) |
    /// | `KIOSK_CLOUDFLARED` | `cloudflared` |
    /// | `KIOSK_STATE_DIR` | `/var/lib/kiosk` |
    /// | `KIOSK_PUBLIC_HOST` | `localhost` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let http_host: IpAddr = parse_var(&lookup, "KIOSK_HTTP_HOST").unwrap_or(default.http_addr.ip());
        let http_port: u16 = parse_var(&lookup, "KIOSK_HTTP_PORT").unwrap_or(default.http_addr.port());

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            capacity: parse_var(&lookup, "KIOSK_CAPACITY").unwrap_or(default.capacity),
            max_concurrent: parse_var(&lookup, "KIOSK_MAX_CONCURRENT").unwrap_or(default.max_concurrent),
            idle_timeout: parse_var(&lookup, "KIOSK_IDLE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.idle_timeout),
            base_port: parse_var(&lookup, "KIOSK_BASE_PORT").unwrap_or(default.base_port),
            desktop_image: lookup("KIOSK_DESKTOP_IMAGE").unwrap_or(default.desktop_image),
            terminal_image: lookup("KIOSK_TERMINAL_IMAGE").unwrap_or(default.terminal_image),
            tunnel_mode: lookup("KIOSK_TUNNEL")
                .map(|v| TunnelMode::parse(&v))
                .unwrap_or(default.tunnel_mode),
            cloudflared_path: lookup("KIOSK_CLOUDFLARED")
                .map(PathBuf::from)
                .unwrap_or(default.cloudflared_path),
            state_dir: lookup("KIOSK_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.state_dir),
            public_host: lookup("KIOSK_PUBLIC_HOST").unwrap_or(default.public_host),
        }
    }

    /// Orchestrator limits derived from this configuration.
    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig, CoreError> {
        OrchestratorConfig::builder()
            .capacity(self.capacity)
            .max_concurrent_provisioning(self.max_concurrent)
            .idle_timeout(self.idle_timeout)
            .base_port(self.base_port)
            .build()
    }

    /// Docker backend settings.
    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            desktop_image: self.desktop_image.clone(),
            terminal_image: self.terminal_image.clone(),
            state_dir: self.state_dir.clone(),
            ..DockerConfig::default()
        }
    }

    /// Tunnel settings for cloudflared mode.
    pub fn cloudflared_config(&self) -> CloudflaredConfig {
        CloudflaredConfig {
            binary: self.cloudflared_path.clone(),
            state_dir: self.state_dir.clone(),
            ..CloudflaredConfig::default()
        }
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Hard errors (zero capacity and the like) are reported by
    /// [`orchestrator_config`](Self::orchestrator_config).
    pub fn validate_warn(&self) {
        if self.max_concurrent > self.capacity {
            tracing::warn!(
                max_concurrent = self.max_concurrent,
                capacity = self.capacity,
                "Concurrency ceiling above capacity, capacity is the effective limit"
            );
        }

        if self.tunnel_mode == TunnelMode::Cloudflared
            && self.cloudflared_path.components().count() > 1
            && !self.cloudflared_path.exists()
        {
            tracing::warn!("cloudflared not found: {:?}", self.cloudflared_path);
        }

        if !self.state_dir.exists() {
            tracing::warn!("State directory does not exist yet: {:?}", self.state_dir);
        }

        if self.tunnel_mode == TunnelMode::Direct && self.public_host == "localhost" {
            tracing::warn!("Direct tunnel mode with public host 'localhost', URLs only work locally");
        }

        if self.vnc_ports_overlap() {
            tracing::warn!(
                capacity = self.capacity,
                base_port = self.base_port,
                vnc_port_offset = self.docker_config().vnc_port_offset,
                "Desktop VNC ports overlap instance ports, desktop creates may hit port conflicts"
            );
        }
    }

    /// Whether the VNC host port of one desktop instance can equal the port
    /// assigned to another instance.
    pub fn vnc_ports_overlap(&self) -> bool {
        usize::from(self.docker_config().vnc_port_offset) < self.capacity
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
            None
        }
    }
}
