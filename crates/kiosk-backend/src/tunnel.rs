//! Tunnel backends.
//!
//! [`CloudflaredTunnel`] publishes each sandbox through a `cloudflared`
//! quick tunnel running as a child process. Child PIDs are recorded in pid
//! files so a restarted server can terminate tunnels it no longer owns.
//! [`DirectTunnel`] skips the tunnel and hands out the host's own address.

use crate::error::TunnelError;
use async_trait::async_trait;
use kiosk_core::{BackendError, InstanceId, Tunnel, TunnelBackend, TunnelRef};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Lines that mean the tunnel will never come up.
const FATAL_MARKERS: [&str; 3] = [
    "failed to connect to the edge",
    "authentication required",
    "login required",
];

const URL_PATTERN: &str = r"https://[a-zA-Z0-9-]+\.trycloudflare\.com";

/// Picks the public URL and fatal errors out of `cloudflared` output.
#[derive(Debug, Clone)]
pub struct OutputScanner {
    url: Regex,
}

impl OutputScanner {
    /// Compile the URL pattern.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            url: Regex::new(URL_PATTERN)?,
        })
    }

    /// First public URL printed on `line`, if any.
    pub fn public_url<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.url.find(line).map(|m| m.as_str())
    }

    /// Whether `line` reports an error the tunnel cannot recover from.
    pub fn is_fatal(&self, line: &str) -> bool {
        FATAL_MARKERS.iter().any(|marker| line.contains(marker))
    }
}

/// Configuration for [`CloudflaredTunnel`].
#[derive(Debug, Clone)]
pub struct CloudflaredConfig {
    /// `cloudflared` executable (default: looked up in `PATH`).
    pub binary: PathBuf,
    /// How long to wait for the public URL (default: 30 seconds).
    pub url_timeout: Duration,
    /// How long a closing tunnel gets after SIGTERM before it is killed
    /// (default: 5 seconds).
    pub close_grace: Duration,
    /// Directory holding the pid files.
    pub state_dir: PathBuf,
}

impl Default for CloudflaredConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("cloudflared"),
            url_timeout: Duration::from_secs(30),
            close_grace: Duration::from_secs(5),
            state_dir: PathBuf::from("/var/lib/kiosk"),
        }
    }
}

/// Quick tunnels through `cloudflared`, one child process per instance.
pub struct CloudflaredTunnel {
    config: CloudflaredConfig,
    scanner: OutputScanner,
    children: Mutex<HashMap<TunnelRef, Child>>,
}

impl CloudflaredTunnel {
    /// Create the backend. No process is started until the first `open`.
    pub fn new(config: CloudflaredConfig) -> Result<Self, TunnelError> {
        Ok(Self {
            config,
            scanner: OutputScanner::new()?,
            children: Mutex::new(HashMap::new()),
        })
    }

    fn pid_dir(&self) -> PathBuf {
        self.config.state_dir.join("tunnels")
    }

    fn pid_file(&self, tunnel: &TunnelRef) -> PathBuf {
        self.pid_dir().join(format!("{tunnel}.pid"))
    }

    fn track(&self, tunnel: TunnelRef, child: Child) {
        if let Ok(mut children) = self.children.lock() {
            children.insert(tunnel, child);
        }
    }

    fn untrack(&self, tunnel: &TunnelRef) -> Option<Child> {
        self.children.lock().ok()?.remove(tunnel)
    }

    /// Number of tunnel processes currently owned.
    pub fn active(&self) -> usize {
        self.children.lock().map(|c| c.len()).unwrap_or(0)
    }

    async fn spawn(&self, instance_id: InstanceId, port: u16) -> Result<Tunnel, TunnelError> {
        let binary = self.config.binary.display().to_string();
        let mut child = Command::new(&self.config.binary)
            .arg("tunnel")
            .arg("--url")
            .arg(format!("http://localhost:{port}"))
            .arg("--no-autoupdate")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn { binary, source })?;
        let pid = child.id();
        tracing::debug!(instance_id = %instance_id, port, pid = ?pid, "cloudflared started");

        let (tx, rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        let waited = tokio::time::timeout(self.config.url_timeout, wait_for_url(&self.scanner, rx)).await;
        let public_url = match waited {
            Ok(Ok(url)) => url,
            Ok(Err(TunnelError::Exited(reason))) => {
                terminate(&mut child, self.config.close_grace).await;
                let status = match child.try_wait() {
                    Ok(Some(status)) => status.to_string(),
                    _ => reason,
                };
                return Err(TunnelError::Exited(status));
            }
            Ok(Err(e)) => {
                terminate(&mut child, self.config.close_grace).await;
                return Err(e);
            }
            Err(_) => {
                terminate(&mut child, self.config.close_grace).await;
                return Err(TunnelError::UrlTimeout(self.config.url_timeout));
            }
        };

        let tunnel_ref = TunnelRef::new(format!("cloudflared-{instance_id}"));
        if let Some(pid) = pid {
            let path = self.pid_file(&tunnel_ref);
            if let Err(e) = write_pid_file(&path, pid).await {
                terminate(&mut child, self.config.close_grace).await;
                return Err(e.into());
            }
        }
        self.track(tunnel_ref.clone(), child);

        tracing::info!(
            instance_id = %instance_id,
            tunnel = %tunnel_ref,
            public_url = %public_url,
            "Tunnel published"
        );
        Ok(Tunnel {
            tunnel_ref,
            public_url,
        })
    }

    async fn shut(&self, tunnel: &TunnelRef) -> Result<(), TunnelError> {
        let mut child = self
            .untrack(tunnel)
            .ok_or_else(|| TunnelError::Unknown(tunnel.to_string()))?;
        terminate(&mut child, self.config.close_grace).await;
        remove_pid_file(&self.pid_file(tunnel)).await;
        tracing::info!(tunnel = %tunnel, "Tunnel closed");
        Ok(())
    }

    async fn sweep_pid_files(&self) -> Result<usize, TunnelError> {
        let dir = self.pid_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut terminated = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("pid") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            match raw.trim().parse::<i32>() {
                Ok(pid) if pid > 0 => match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    Ok(()) => {
                        tracing::info!(pid, file = %path.display(), "Terminated leftover tunnel");
                        terminated += 1;
                    }
                    Err(Errno::ESRCH) => {
                        tracing::debug!(pid, "Leftover tunnel already exited");
                    }
                    Err(e) => {
                        tracing::warn!(pid, error = %e, "Failed to terminate leftover tunnel");
                    }
                },
                _ => tracing::warn!(file = %path.display(), "Ignoring malformed pid file"),
            }
            remove_pid_file(&path).await;
        }
        Ok(terminated)
    }
}

#[async_trait]
impl TunnelBackend for CloudflaredTunnel {
    async fn open(&self, instance_id: InstanceId, port: u16) -> Result<Tunnel, BackendError> {
        Ok(self.spawn(instance_id, port).await?)
    }

    async fn close(&self, tunnel: &TunnelRef) -> Result<(), BackendError> {
        Ok(self.shut(tunnel).await?)
    }

    async fn sweep(&self) -> Result<usize, BackendError> {
        Ok(self.sweep_pid_files().await?)
    }
}

/// Read lines from a child pipe and forward them.
///
/// Keeps reading after the receiver is gone so the child never blocks on
/// a full pipe.
async fn forward_lines<R>(pipe: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::trace!(line = %line, "cloudflared");
        if !tx.is_closed() {
            let _ = tx.send(line).await;
        }
    }
}

async fn wait_for_url(
    scanner: &OutputScanner,
    mut rx: mpsc::Receiver<String>,
) -> Result<String, TunnelError> {
    while let Some(line) = rx.recv().await {
        if let Some(url) = scanner.public_url(&line) {
            return Ok(url.to_string());
        }
        if scanner.is_fatal(&line) {
            return Err(TunnelError::Refused(line.trim().to_string()));
        }
    }
    Err(TunnelError::Exited("output closed".into()))
}

/// SIGTERM, then SIGKILL if the child does not exit within `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "SIGTERM failed");
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!(pid = ?child.id(), "Tunnel did not exit after SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill tunnel process");
            }
        }
    }
}

async fn write_pid_file(path: &Path, pid: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, pid.to_string()).await
}

async fn remove_pid_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(file = %path.display(), error = %e, "Failed to remove pid file"),
    }
}

// ============================================================================
// Direct
// ============================================================================

/// Publishes sandboxes at `<scheme>://<public_host>:<port>` without a
/// tunnel, for hosts that are reachable directly or sit behind a proxy.
pub struct DirectTunnel {
    scheme: String,
    public_host: String,
    open: Mutex<HashSet<TunnelRef>>,
}

impl DirectTunnel {
    /// Create a backend publishing `http://<public_host>:<port>`.
    pub fn new(public_host: impl Into<String>) -> Self {
        Self {
            scheme: "http".into(),
            public_host: public_host.into(),
            open: Mutex::new(HashSet::new()),
        }
    }

    /// Use another URL scheme (e.g. `https` behind a TLS proxy).
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }
}

#[async_trait]
impl TunnelBackend for DirectTunnel {
    async fn open(&self, instance_id: InstanceId, port: u16) -> Result<Tunnel, BackendError> {
        let tunnel_ref = TunnelRef::new(format!("direct-{instance_id}"));
        if let Ok(mut open) = self.open.lock() {
            open.insert(tunnel_ref.clone());
        }
        Ok(Tunnel {
            tunnel_ref,
            public_url: format!("{}://{}:{port}", self.scheme, self.public_host),
        })
    }

    async fn close(&self, tunnel: &TunnelRef) -> Result<(), BackendError> {
        let removed = self
            .open
            .lock()
            .map(|mut open| open.remove(tunnel))
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(BackendError::NotFound(tunnel.to_string()))
        }
    }

    async fn sweep(&self) -> Result<usize, BackendError> {
        Ok(0)
    }
}
