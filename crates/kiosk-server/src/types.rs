//! Request and response bodies of the HTTP API.

use kiosk_backend::hardware::DEFAULT_PROFILE;
use kiosk_core::{
    Admission, InstanceId, InstanceStatus, InterfaceKind, QueueInfo, SystemStatus,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Instances
// ============================================================================

/// Body of `POST /api/instances`.
#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    /// Resource-class label such as `24v64g` (default: `24v64g`).
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Interface the sandbox serves (default: desktop).
    #[serde(default)]
    pub interface: InterfaceKind,
}

impl Default for CreateInstanceRequest {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            interface: InterfaceKind::default(),
        }
    }
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

/// Result of an accepted instance request.
#[derive(Debug, Serialize)]
pub struct CreateInstanceResponse {
    pub success: bool,
    pub instance_id: InstanceId,
    /// `creating` when provisioning started, `queued` otherwise.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueInfo>,
}

impl From<Admission> for CreateInstanceResponse {
    fn from(admission: Admission) -> Self {
        Self {
            success: true,
            instance_id: admission.instance_id,
            status: admission.status_label(),
            queue: admission.queue,
        }
    }
}

/// Result of `GET /api/instances/:instance_id`.
#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub success: bool,
    pub instance: InstanceStatus,
}

/// Result of `GET /api/user-status`.
#[derive(Debug, Serialize)]
pub struct UserStatusResponse {
    /// The caller's identity token.
    pub user_id: String,
    /// Whether the caller owns a live instance.
    pub has_instance: bool,
    /// Status of the caller's instance, or the outcome of its last one.
    pub instance: Option<InstanceStatus>,
}

// ============================================================================
// System
// ============================================================================

/// Result of `GET /api/system-status`.
#[derive(Debug, Serialize)]
pub struct SystemStatusResponse {
    pub success: bool,
    #[serde(flatten)]
    pub status: SystemStatus,
}

/// Plain acknowledgement for heartbeat and delete.
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
}

/// Error body returned with every non-2xx status.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable message.
    pub error: String,
}

impl ErrorResponse {
    pub fn new(code: &'static str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosk_core::{InstanceState, ProvisionStep};

    #[test]
    fn test_create_request_defaults() {
        let req: CreateInstanceRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.profile, "24v64g");
        assert_eq!(req.interface, InterfaceKind::Desktop);

        let req: CreateInstanceRequest =
            serde_json::from_str(r#"{"profile":"4v16g","interface":"terminal"}"#).unwrap();
        assert_eq!(req.profile, "4v16g");
        assert_eq!(req.interface, InterfaceKind::Terminal);
    }

    #[test]
    fn test_unknown_interface_is_rejected() {
        let result = serde_json::from_str::<CreateInstanceRequest>(r#"{"interface":"gpu"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_response_reports_coarse_status() {
        let admission = Admission {
            instance_id: InstanceId::new(),
            state: InstanceState::Provisioning(ProvisionStep::Container),
            queue: None,
        };
        let json = serde_json::to_value(CreateInstanceResponse::from(admission)).unwrap();
        assert_eq!(json["status"], "creating");
        assert!(json.get("queue").is_none());

        let admission = Admission {
            instance_id: InstanceId::new(),
            state: InstanceState::Queued,
            queue: Some(QueueInfo {
                position: 2,
                estimated_wait_seconds: 120,
            }),
        };
        let json = serde_json::to_value(CreateInstanceResponse::from(admission)).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["queue"]["position"], 2);
    }

    #[test]
    fn test_system_status_is_flattened() {
        let body = SystemStatusResponse {
            success: true,
            status: SystemStatus {
                active_count: 1,
                queued_count: 2,
                provisioning_count: 1,
                ports_in_use: 2,
                capacity: 10,
                concurrency_ceiling: 2,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["queued_count"], 2);
        assert_eq!(json["concurrency_ceiling"], 2);
    }

    #[test]
    fn test_error_body() {
        let json = serde_json::to_value(ErrorResponse::new("not_found", "instance not found")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "not_found");
    }
}
