//! Integration tests for kiosk-backend.
//!
//! These tests require:
//! - A reachable Docker daemon
//! - The terminal image (pulled on first use)
//! - `cloudflared` in `PATH` and outbound network access for the tunnel test
//!
//! Run with: `cargo test -p kiosk-backend -- --ignored`

use kiosk_backend::{CloudflaredConfig, CloudflaredTunnel, DockerBackend, DockerConfig};
use kiosk_core::{ContainerBackend, HealthStatus, InstanceId, InterfaceKind, SandboxSpec, TunnelBackend};
use std::time::Duration;

fn state_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("kiosk-it-{name}-{}", std::process::id()))
}

/// Full sandbox lifecycle: create -> start -> healthy -> listed -> remove
#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_sandbox_lifecycle() {
    let backend = DockerBackend::connect(DockerConfig {
        state_dir: state_dir("docker"),
        ..DockerConfig::default()
    })
    .expect("Failed to connect to Docker");
    if backend.ping().await.is_err() {
        eprintln!("Skipping test: Docker daemon not reachable");
        return;
    }

    let spec = SandboxSpec {
        instance_id: InstanceId::new(),
        port: 17681,
        profile: "2v4g".into(),
        interface: InterfaceKind::Terminal,
    };
    let sandbox = backend.create(&spec).await.expect("Failed to create sandbox");
    backend.start(&sandbox).await.expect("Failed to start sandbox");

    let mut healthy = false;
    for _ in 0..30 {
        if backend.health_status(&sandbox).await.unwrap() == HealthStatus::Healthy {
            healthy = true;
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(healthy, "sandbox never became healthy");
    assert!(backend.is_alive(&sandbox).await.unwrap());
    assert!(backend.list_tagged().await.unwrap().contains(&sandbox));

    backend.remove(&sandbox).await.expect("Failed to remove sandbox");
    assert!(!backend.is_alive(&sandbox).await.unwrap());
    assert!(backend.remove(&sandbox).await.unwrap_err().is_not_found());
}

/// Quick tunnel: open -> public URL -> close -> leftover sweep is empty
#[tokio::test]
#[ignore = "requires cloudflared and network access"]
async fn test_quick_tunnel() {
    let tunnel = CloudflaredTunnel::new(CloudflaredConfig {
        state_dir: state_dir("tunnel"),
        url_timeout: Duration::from_secs(60),
        ..CloudflaredConfig::default()
    })
    .unwrap();

    let opened = tunnel
        .open(InstanceId::new(), 17682)
        .await
        .expect("Failed to open tunnel");
    assert!(opened.public_url.starts_with("https://"));
    assert!(opened.public_url.ends_with(".trycloudflare.com"));
    assert_eq!(tunnel.active(), 1);

    tunnel.close(&opened.tunnel_ref).await.expect("Failed to close tunnel");
    assert_eq!(tunnel.active(), 0);
    assert_eq!(tunnel.sweep().await.unwrap(), 0);
}
