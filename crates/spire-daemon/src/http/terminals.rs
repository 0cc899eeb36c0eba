//! Terminal CRUD and I/O endpoints.

use crate::app::{self, AppState};
use crate::http::{ApiError, ApiResult};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use spire_core::session::PtySession;
use spire_core::SpireError;
use spire_types::api::{
    CreateTerminalRequest, OutputResponse, ResizeRequest, TerminalSummary, WriteRequest,
};
use std::sync::Arc;

fn lookup(state: &AppState, id: &str) -> Result<Arc<PtySession>, ApiError> {
    state
        .sessions
        .get(id)
        .map(|s| s.clone())
        .ok_or_else(|| ApiError(SpireError::not_found(format!("no terminal {}", id))))
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateTerminalRequest>,
) -> ApiResult<Json<TerminalSummary>> {
    if req.command.trim().is_empty() {
        return Err(ApiError(SpireError::InvalidParams("command must not be empty".into())));
    }
    let session = app::create_terminal(&state, req).await?;
    Ok(Json(app::summarize(&state, &session).await))
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<TerminalSummary>> {
    let mut summaries = Vec::new();
    let sessions: Vec<Arc<PtySession>> =
        state.sessions.iter().map(|entry| entry.value().clone()).collect();
    for session in sessions {
        summaries.push(app::summarize(&state, &session).await);
    }
    summaries.sort_by(|a, b| a.id.cmp(&b.id));
    Json(summaries)
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TerminalSummary>> {
    let session = lookup(&state, &id)?;
    Ok(Json(app::summarize(&state, &session).await))
}

pub async fn kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TerminalSummary>> {
    let session = lookup(&state, &id)?;
    app::kill_terminal(&state, &session).await;
    Ok(Json(app::summarize(&state, &session).await))
}

pub async fn write(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WriteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = lookup(&state, &id)?;
    let bytes = req.data.into_bytes();
    session.record_user_input(&bytes);
    session.write(bytes);
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.cols == 0 || req.rows == 0 {
        return Err(ApiError(SpireError::InvalidParams("cols and rows must be positive".into())));
    }
    let session = lookup(&state, &id)?;
    session.resize(req.cols, req.rows);
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct OutputQuery {
    since: Option<u64>,
}

pub async fn output(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<Json<OutputResponse>> {
    let session = lookup(&state, &id)?;
    let (lines, seq, overflow) = session.read_output(query.since);
    Ok(Json(OutputResponse { lines, seq, overflow }))
}
