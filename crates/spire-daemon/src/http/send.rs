//! `POST /api/send`: structured message delivery between agents.

use crate::app::AppState;
use crate::http::{ApiError, ApiResult};
use axum::extract::State;
use axum::Json;
use spire_core::dispatch::SendMessage;
use spire_core::paths::canonicalize_workspace;
use spire_core::SpireError;
use spire_types::api::{SendRequest, SendResponse};
use std::path::PathBuf;

/// A workspace parameter may be an absolute path or a known workspace
/// basename; both collapse to the canonical path.
async fn workspace_param(state: &AppState, raw: &str) -> Result<PathBuf, SpireError> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return canonicalize_workspace(&path);
    }
    let matches = state.registry.find_workspaces(&raw.to_lowercase()).await;
    match matches.len() {
        1 => Ok(matches.into_iter().next().expect("len checked")),
        0 => Err(SpireError::not_found(format!("no active workspace named {:?}", raw))),
        _ => Err(SpireError::Ambiguous {
            message: format!("workspace name {:?} matches several paths", raw),
            candidates: matches.iter().map(|p| p.display().to_string()).collect(),
        }),
    }
}

pub async fn send(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> ApiResult<Json<SendResponse>> {
    if req.message.is_empty() {
        return Err(ApiError(SpireError::InvalidParams("message must not be empty".into())));
    }
    let workspace = match &req.workspace {
        Some(raw) => Some(workspace_param(&state, raw).await?),
        None => None,
    };
    let from_workspace = match &req.from_workspace {
        Some(raw) => Some(workspace_param(&state, raw).await?),
        None => None,
    };

    let outcome = state
        .dispatcher
        .send(SendMessage {
            to: req.to,
            message: req.message,
            from: req.from,
            workspace,
            from_workspace,
            options: req.options,
        })
        .await?;

    Ok(Json(SendResponse {
        delivered_to: format!(
            "{}:{}",
            spire_core::paths::workspace_basename(&outcome.target.workspace),
            outcome.target.agent
        ),
        terminal_id: outcome.target.terminal_id,
        immediate: outcome.immediate,
    }))
}
