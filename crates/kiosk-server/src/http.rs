//! HTTP API for the browser front end.
//!
//! Callers are identified by an opaque `kiosk_id` cookie issued on first
//! contact; the orchestrator only uses it as a map key.
//!
//! ## Endpoints
//!
//! - `GET /api/user-status` - Whether the caller owns an instance
//! - `POST /api/instances` - Request an instance
//! - `GET /api/instances/:instance_id` - Instance status (counts as activity)
//! - `POST /api/heartbeat` - Keep the caller's instance alive
//! - `DELETE /api/instances` - Delete the caller's instance
//! - `GET /api/system-status` - Aggregate counters
//! - `GET /health` - Health check
//! - `GET /` - Server info

use crate::types::{
    AckResponse, CreateInstanceRequest, CreateInstanceResponse, ErrorResponse, InstanceResponse,
    SystemStatusResponse, UserStatusResponse,
};
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, State},
    http::{
        header::{COOKIE, SET_COOKIE},
        request::Parts,
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use kiosk_core::{AdmissionError, CoreError, Identity, InstanceId, Orchestrator};
use std::convert::Infallible;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Name of the identity cookie.
pub const COOKIE_NAME: &str = "kiosk_id";

/// Lifetime of the identity cookie (24 hours).
pub const COOKIE_MAX_AGE_SECS: u64 = 24 * 60 * 60;

/// Build the HTTP router.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    tracing::debug!("Building HTTP router");

    let router = Router::new()
        .route("/api/user-status", get(user_status_handler))
        .route(
            "/api/instances",
            post(create_instance_handler).delete(delete_instance_handler),
        )
        .route("/api/instances/:instance_id", get(instance_status_handler))
        .route("/api/heartbeat", post(heartbeat_handler))
        .route("/api/system-status", get(system_status_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .with_state(orchestrator)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    tracing::debug!("HTTP router built");
    router
}

// ============================================================================
// Identity cookie
// ============================================================================

/// The caller's identity, read from the cookie or freshly issued.
#[derive(Debug, Clone)]
pub struct Caller {
    identity: Identity,
    fresh: bool,
}

impl Caller {
    /// Identity from the request headers, or a new one if the cookie is
    /// missing or malformed.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match cookie_value(headers, COOKIE_NAME).and_then(|v| Uuid::parse_str(v).ok()) {
            Some(id) => Self {
                identity: Identity::new(id.to_string()),
                fresh: false,
            },
            None => {
                let id = Uuid::new_v4();
                tracing::debug!(identity = %id, "Issuing identity cookie");
                Self {
                    identity: Identity::new(id.to_string()),
                    fresh: true,
                }
            }
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether the cookie was issued by this request.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Turn `body` into a response, attaching `Set-Cookie` for a fresh
    /// identity.
    fn respond(self, body: impl IntoResponse) -> Response {
        let mut response = body.into_response();
        if self.fresh {
            let cookie = format!(
                "{COOKIE_NAME}={}; Max-Age={COOKIE_MAX_AGE_SECS}; Path=/; HttpOnly; SameSite=Lax",
                self.identity
            );
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }
        response
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

/// Value of cookie `name` across all `Cookie` headers.
fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
}

// ============================================================================
// Errors
// ============================================================================

/// Orchestrator error rendered as JSON with a matching status code.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            CoreError::Admission(AdmissionError::AlreadyHasInstance) => {
                (StatusCode::CONFLICT, "already_has_instance")
            }
            CoreError::Admission(AdmissionError::CapacityExceeded { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "capacity_exceeded")
            }
            CoreError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            CoreError::InvalidConfig(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        (status, Json(ErrorResponse::new(code, self.0.to_string()))).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn user_status_handler(State(orchestrator): State<Orchestrator>, caller: Caller) -> Response {
    let instance = orchestrator.user_status(caller.identity()).await;
    let has_instance = instance.as_ref().is_some_and(|i| !i.state.is_terminal());

    let body = UserStatusResponse {
        user_id: caller.identity().to_string(),
        has_instance,
        instance,
    };
    caller.respond(Json(body))
}

async fn create_instance_handler(
    State(orchestrator): State<Orchestrator>,
    caller: Caller,
    body: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected instance request body");
            let error = ErrorResponse::new("invalid_request", rejection.body_text());
            return caller.respond((StatusCode::BAD_REQUEST, Json(error)));
        }
    };

    let result = orchestrator
        .request_instance(caller.identity().clone(), request.profile, request.interface)
        .await
        .map(|admission| Json(CreateInstanceResponse::from(admission)))
        .map_err(ApiError::from);
    caller.respond(result)
}

async fn instance_status_handler(
    State(orchestrator): State<Orchestrator>,
    caller: Caller,
    Path(instance_id): Path<String>,
) -> Response {
    let result = match instance_id.parse::<InstanceId>() {
        Ok(id) => orchestrator
            .status(caller.identity(), id)
            .await
            .map(|instance| Json(InstanceResponse {
                success: true,
                instance,
            }))
            .map_err(ApiError::from),
        Err(_) => Err(ApiError(CoreError::NotFound)),
    };
    caller.respond(result)
}

async fn heartbeat_handler(State(orchestrator): State<Orchestrator>, caller: Caller) -> Response {
    let result = orchestrator
        .heartbeat(caller.identity())
        .await
        .map(|()| Json(AckResponse { success: true }))
        .map_err(ApiError::from);
    caller.respond(result)
}

async fn delete_instance_handler(
    State(orchestrator): State<Orchestrator>,
    caller: Caller,
) -> Response {
    let result = orchestrator
        .delete(caller.identity())
        .await
        .map(|()| Json(AckResponse { success: true }))
        .map_err(ApiError::from);
    caller.respond(result)
}

async fn system_status_handler(State(orchestrator): State<Orchestrator>) -> impl IntoResponse {
    Json(SystemStatusResponse {
        success: true,
        status: orchestrator.system_status().await,
    })
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "kiosk-server"
    }))
}

/// Root endpoint with server info.
async fn root_handler() -> impl IntoResponse {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Kiosk</title>
    <style>
        body { font-family: system-ui; max-width: 800px; margin: 50px auto; padding: 20px; }
        code { background: #f4f4f4; padding: 2px 6px; border-radius: 3px; }
    </style>
</head>
<body>
    <h1>Kiosk</h1>
    <p>Disposable desktop and terminal sandboxes, one per visitor.</p>

    <h2>Endpoints</h2>
    <ul>
        <li><code>GET /api/user-status</code> - Your instance, if any</li>
        <li><code>POST /api/instances</code> - Request an instance</li>
        <li><code>GET /api/instances/:instance_id</code> - Instance status</li>
        <li><code>POST /api/heartbeat</code> - Keep your instance alive</li>
        <li><code>DELETE /api/instances</code> - Delete your instance</li>
        <li><code>GET /api/system-status</code> - Capacity and queue</li>
    </ul>
</body>
</html>"#,
    )
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    orchestrator: Orchestrator,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(orchestrator);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
