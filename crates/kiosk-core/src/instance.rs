//! Instance identifiers, states and the read-only views handed to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an instance.
///
/// Backed by a UUIDv7, so identifiers sort roughly by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Create a new time-ordered instance ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for InstanceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque, stable token identifying a requester.
///
/// The orchestrator only uses it as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap a token supplied by the request layer.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of interface the sandbox serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// Graphical desktop reachable through a browser VNC client.
    #[default]
    Desktop,
    /// Browser terminal.
    Terminal,
}

impl InterfaceKind {
    /// Lowercase label used in logs, labels and the wire format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Terminal => "terminal",
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterfaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "desktop" | "vnc" => Ok(Self::Desktop),
            "terminal" | "tty" | "shell" => Ok(Self::Terminal),
            other => Err(format!("unknown interface kind: {other}")),
        }
    }
}

/// Provisioning sub-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    /// Creating and starting the sandbox.
    Container,
    /// Publishing the sandbox port.
    Tunnel,
}

/// Lifecycle state of an instance.
///
/// Instances move strictly forward through
/// `Queued → Provisioning(Container) → Provisioning(Tunnel) → Starting → Ready`;
/// `Error` and `Deleted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Waiting for a provisioning slot.
    Queued,
    /// Provisioning is running the given step.
    Provisioning(ProvisionStep),
    /// Waiting for the sandbox to report healthy.
    Starting,
    /// Reachable through its public URL.
    Ready,
    /// Provisioning failed and the instance was cleaned up.
    Error,
    /// Deleted by its owner, idle eviction, the liveness sweep or shutdown.
    Deleted,
}

impl InstanceState {
    /// Wire label for the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Provisioning(ProvisionStep::Container) => "creating_container",
            Self::Provisioning(ProvisionStep::Tunnel) => "creating_tunnel",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }

    /// Whether the state is `Error` or `Deleted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Deleted)
    }

    /// Whether the instance is between slot acquisition and readiness.
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::Provisioning(_) | Self::Starting)
    }

    /// Whether `next` is the state directly following `self` in the
    /// provisioning sequence.
    pub fn advances_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        use ProvisionStep::*;
        matches!(
            (self, next),
            (Queued, Provisioning(Container))
                | (Provisioning(Container), Provisioning(Tunnel))
                | (Provisioning(Tunnel), Starting)
                | (Starting, Ready)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for InstanceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Queue bookkeeping for a queued instance. Recomputed on every promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    /// 1-based position in the wait list.
    pub position: usize,
    /// `position` times the configured per-slot estimate.
    pub estimated_wait_seconds: u64,
}

/// Consistent snapshot of an instance, as returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    /// Instance identifier.
    pub instance_id: InstanceId,
    /// Requested resource-class label (descriptive only).
    pub profile: String,
    /// Interface served by the sandbox.
    pub interface: InterfaceKind,
    /// Current state.
    pub state: InstanceState,
    /// Public address, once the tunnel is open.
    pub public_url: Option<String>,
    /// Local port assigned to the sandbox.
    pub port: Option<u16>,
    /// Reason of the last failure, if any.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Wait-list information while queued.
    pub queue: Option<QueueInfo>,
}

/// Result of an accepted `request_instance` call.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    /// Identifier of the new instance.
    pub instance_id: InstanceId,
    /// `Provisioning(Container)` when started immediately, `Queued` otherwise.
    pub state: InstanceState,
    /// Wait-list information when queued.
    pub queue: Option<QueueInfo>,
}

impl Admission {
    /// Whether the request had to wait for a slot.
    pub fn is_queued(&self) -> bool {
        self.state == InstanceState::Queued
    }

    /// Coarse label reported to the requester: `queued` or `creating`.
    ///
    /// Per-step labels are only exposed through instance status.
    pub fn status_label(&self) -> &'static str {
        if self.is_queued() {
            "queued"
        } else {
            "creating"
        }
    }
}

/// Aggregate counters of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    /// Instances in the `Ready` state.
    pub active_count: usize,
    /// Instances waiting for a slot.
    pub queued_count: usize,
    /// Instances holding a provisioning slot.
    pub provisioning_count: usize,
    /// Local ports currently assigned.
    pub ports_in_use: usize,
    /// Capacity limit.
    pub capacity: usize,
    /// Concurrency ceiling.
    pub concurrency_ceiling: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_roundtrip_display() {
        let id = InstanceId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 36);
        assert_eq!(s.parse::<InstanceId>().unwrap(), id);
    }

    #[test]
    fn test_instance_ids_are_time_ordered() {
        let first = InstanceId::new();
        let second = InstanceId::new();
        assert!(first < second);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(InstanceState::Queued.to_string(), "queued");
        assert_eq!(
            InstanceState::Provisioning(ProvisionStep::Container).to_string(),
            "creating_container"
        );
        assert_eq!(InstanceState::Starting.to_string(), "starting");
        assert_eq!(
            serde_json::to_string(&InstanceState::Ready).unwrap(),
            "\"ready\""
        );
    }

    #[test]
    fn test_state_sequence_has_no_skips() {
        use InstanceState::*;
        use ProvisionStep::*;
        assert!(Queued.advances_to(Provisioning(Container)));
        assert!(Provisioning(Container).advances_to(Provisioning(Tunnel)));
        assert!(Provisioning(Tunnel).advances_to(Starting));
        assert!(Starting.advances_to(Ready));

        assert!(!Queued.advances_to(Provisioning(Tunnel)));
        assert!(!Provisioning(Container).advances_to(Ready));
        assert!(!Ready.advances_to(Starting));
    }

    #[test]
    fn test_interface_kind_parsing() {
        assert_eq!("Desktop".parse::<InterfaceKind>(), Ok(InterfaceKind::Desktop));
        assert_eq!("tty".parse::<InterfaceKind>(), Ok(InterfaceKind::Terminal));
        assert!("kiosk".parse::<InterfaceKind>().is_err());
        assert_eq!(
            serde_json::from_str::<InterfaceKind>("\"terminal\"").unwrap(),
            InterfaceKind::Terminal
        );
    }

    #[test]
    fn test_admission_label_is_coarse() {
        let started = Admission {
            instance_id: InstanceId::new(),
            state: InstanceState::Provisioning(ProvisionStep::Container),
            queue: None,
        };
        assert_eq!(started.status_label(), "creating");

        let queued = Admission {
            state: InstanceState::Queued,
            queue: Some(QueueInfo {
                position: 1,
                estimated_wait_seconds: 60,
            }),
            ..started
        };
        assert_eq!(queued.status_label(), "queued");
    }
}
