//! HTTP router, error mapping, and the optional WEB_KEY gate.

pub mod health;
pub mod send;
pub mod terminals;
pub mod workspaces;
pub mod ws;

use crate::app::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use spire_core::paths::constant_time_eq;
use spire_core::SpireError;
use spire_types::api::{ErrorBody, ErrorCode};
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Error wrapper translating supervisor errors into the stable HTTP
/// envelope.
pub struct ApiError(pub SpireError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status =
            StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if code == ErrorCode::InternalError {
            tracing::error!("internal error: {}", self.0);
        }
        let body = ErrorBody::new(code, self.0.to_string())
            .with_candidates(self.0.candidates().to_vec());
        (status, Json(body)).into_response()
    }
}

impl From<SpireError> for ApiError {
    fn from(err: SpireError) -> Self {
        ApiError(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/state", get(health::state_summary))
        .route("/api/workspaces", get(workspaces::list))
        .route("/api/workspaces/:ws/activate", post(workspaces::activate))
        .route("/api/workspaces/:ws/deactivate", post(workspaces::deactivate))
        .route("/api/workspaces/:ws/status", get(workspaces::status))
        .route(
            "/api/workspaces/:ws/tabs",
            get(workspaces::list_tabs).post(workspaces::open_tab),
        )
        .route("/api/workspaces/:ws/tabs/:tab", delete(workspaces::close_tab))
        .route("/api/terminals", get(terminals::list).post(terminals::create))
        .route("/api/terminals/:id", get(terminals::get_one).delete(terminals::kill))
        .route("/api/terminals/:id/write", post(terminals::write))
        .route("/api/terminals/:id/resize", post(terminals::resize))
        .route("/api/terminals/:id/output", get(terminals::output))
        .route("/api/send", post(send::send))
        .route("/ws/terminal/:id", get(ws::terminal_upgrade))
        .route("/workspace/:ws/ws/terminal/:id", get(ws::workspace_terminal_upgrade))
        .route("/ws/messages", get(ws::messages_upgrade))
        .layer(middleware::from_fn_with_state(state.clone(), require_web_key))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Decode a base64url workspace path segment.
pub fn decode_ws_segment(segment: &str) -> Result<PathBuf, ApiError> {
    spire_types::decode_workspace_segment(segment)
        .map(PathBuf::from)
        .map_err(|_| ApiError(SpireError::InvalidParams("bad workspace path encoding".into())))
}

/// When `WEB_KEY` is set, every request (including WS upgrades) must carry
/// the token: `Authorization: Bearer`, `?token=`, or a
/// `Sec-WebSocket-Protocol` entry of `spire-key.<token>`. Comparison is
/// constant-time.
async fn require_web_key(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.web_key.clone() else {
        return next.run(request).await;
    };

    let provided = extract_token(request.headers(), request.uri().query());
    let ok = provided
        .map(|token| constant_time_eq(token.as_bytes(), expected.as_bytes()))
        .unwrap_or(false);
    if !ok {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": { "code": "UNAUTHORIZED", "message": "missing or invalid key" }
            })),
        )
            .into_response();
    }
    next.run(request).await
}

fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }
    if let Some(token) = headers
        .get("sec-websocket-protocol")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            h.split(',').map(str::trim).find_map(|proto| proto.strip_prefix("spire-key."))
        })
    {
        return Some(token.to_string());
    }
    query.and_then(|q| {
        q.split('&').find_map(|pair| pair.strip_prefix("token=")).map(|t| t.to_string())
    })
}
