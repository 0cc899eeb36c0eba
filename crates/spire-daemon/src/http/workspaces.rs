//! Workspace activation, status, and file-tab endpoints.

use crate::app::{self, AppState};
use crate::http::{decode_ws_segment, ApiError, ApiResult};
use axum::extract::{ConnectInfo, Path, State};
use axum::Json;
use spire_core::paths::canonicalize_workspace;
use spire_core::SpireError;
use spire_types::api::{FileTabSummary, OpenFileTabRequest, WorkspaceSummary};
use std::net::SocketAddr;

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkspaceSummary>>> {
    let known = state
        .store
        .list_known_workspaces()
        .await
        .map_err(|e| ApiError(SpireError::Internal(e.to_string())))?;
    let entries = state.registry.read().await;
    let mut out = Vec::with_capacity(known.len());
    for workspace in known {
        let path = std::path::PathBuf::from(&workspace.workspace_path);
        let (active, terminals) = entries
            .get(&path)
            .map(|entry| (true, entry.terminal_count()))
            .unwrap_or((false, 0));
        out.push(WorkspaceSummary {
            path: workspace.workspace_path,
            name: workspace.name,
            last_launched_at: Some(workspace.last_launched_at),
            active,
            terminals,
        });
    }
    Ok(Json(out))
}

pub async fn activate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(ws): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.activate_limiter.check(addr.ip()) {
        return Err(ApiError(SpireError::RateLimited(
            "too many workspace activations, slow down".to_string(),
        )));
    }
    let raw = decode_ws_segment(&ws)?;
    let workspace = canonicalize_workspace(&raw)?;
    state.registry.activate_workspace(&workspace).await?;
    Ok(Json(serde_json::json!({
        "workspacePath": workspace.to_string_lossy(),
        "active": true,
    })))
}

/// Deactivation kills the workspace's terminals and drops the entry; the
/// workspace stays known.
pub async fn deactivate(
    State(state): State<AppState>,
    Path(ws): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let raw = decode_ws_segment(&ws)?;
    // a deleted directory must still be deactivatable
    let workspace = canonicalize_workspace(&raw).unwrap_or(raw);
    let ids = state.registry.remove_workspace(&workspace).await;
    let mut killed = 0usize;
    for id in &ids {
        if let Some(session) = state.sessions.get(id).map(|s| s.clone()) {
            app::kill_terminal(&state, &session).await;
            killed += 1;
        }
        // registry entry is gone already; make sure the durable rows are
        // too, even if the session had died earlier
        if let Err(e) = state.store.delete_session(id).await {
            tracing::warn!("failed to delete record {}: {}", id, e);
        }
    }
    Ok(Json(serde_json::json!({
        "workspacePath": workspace.to_string_lossy(),
        "active": false,
        "terminalsKilled": killed,
    })))
}

pub async fn status(
    State(state): State<AppState>,
    Path(ws): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let raw = decode_ws_segment(&ws)?;
    let workspace = canonicalize_workspace(&raw).unwrap_or(raw);
    let entries = state.registry.read().await;
    let Some(entry) = entries.get(&workspace) else {
        return Ok(Json(serde_json::json!({
            "workspacePath": workspace.to_string_lossy(),
            "active": false,
        })));
    };

    let session_status = |id: &String| {
        state
            .sessions
            .get(id)
            .map(|s| s.status().as_str().to_string())
            .unwrap_or_else(|| "exited".to_string())
    };
    Ok(Json(serde_json::json!({
        "workspacePath": workspace.to_string_lossy(),
        "active": true,
        "architect": entry.architect.as_ref().map(|id| serde_json::json!({
            "terminalId": id, "status": session_status(id),
        })),
        "builders": entry.builders.iter().map(|(key, id)| serde_json::json!({
            "roleId": key, "terminalId": id, "status": session_status(id),
        })).collect::<Vec<_>>(),
        "shells": entry.shells.iter().map(|(key, id)| serde_json::json!({
            "roleId": key, "terminalId": id, "status": session_status(id),
        })).collect::<Vec<_>>(),
        "fileTabs": entry.file_tabs.len(),
    })))
}

pub async fn list_tabs(
    State(state): State<AppState>,
    Path(ws): Path<String>,
) -> ApiResult<Json<Vec<FileTabSummary>>> {
    let raw = decode_ws_segment(&ws)?;
    let workspace = canonicalize_workspace(&raw)?;
    let entries = state.registry.read().await;
    let tabs = entries
        .get(&workspace)
        .map(|entry| {
            let mut tabs: Vec<FileTabSummary> = entry
                .file_tabs
                .values()
                .map(|tab| FileTabSummary {
                    id: tab.id.clone(),
                    file_path: tab.file_path.clone(),
                    created_at: tab.created_at,
                })
                .collect();
            tabs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            tabs
        })
        .unwrap_or_default();
    Ok(Json(tabs))
}

pub async fn open_tab(
    State(state): State<AppState>,
    Path(ws): Path<String>,
    Json(req): Json<OpenFileTabRequest>,
) -> ApiResult<Json<FileTabSummary>> {
    let raw = decode_ws_segment(&ws)?;
    let workspace = canonicalize_workspace(&raw)?;
    // tabs may only point inside their workspace
    let file = std::path::PathBuf::from(&req.file_path);
    if !file.starts_with(&workspace) {
        return Err(ApiError(SpireError::InvalidParams(format!(
            "{} is outside workspace {}",
            req.file_path,
            workspace.display()
        ))));
    }
    let tab = state.registry.open_file_tab(&workspace, &req.file_path).await?;
    Ok(Json(FileTabSummary { id: tab.id, file_path: tab.file_path, created_at: tab.created_at }))
}

pub async fn close_tab(
    State(state): State<AppState>,
    Path((ws, tab)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let raw = decode_ws_segment(&ws)?;
    let workspace = canonicalize_workspace(&raw)?;
    state.registry.close_file_tab(&workspace, &tab).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
