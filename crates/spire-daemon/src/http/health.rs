//! Health and dashboard-state endpoints.

use crate::app::AppState;
use axum::extract::State;
use axum::Json;
use spire_types::api::HealthResponse;

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        terminals: state.sessions.len(),
        workspaces: state.registry.read().await.len(),
        rss_bytes: rss_bytes(),
    })
}

pub async fn state_summary(State(state): State<AppState>) -> Json<serde_json::Value> {
    let entries = state.registry.read().await;
    let workspaces: Vec<serde_json::Value> = entries
        .iter()
        .map(|(path, entry)| {
            serde_json::json!({
                "path": path.to_string_lossy(),
                "name": spire_core::paths::workspace_basename(path),
                "architect": entry.architect,
                "builders": entry.builders,
                "shells": entry.shells,
                "fileTabs": entry.file_tabs.len(),
            })
        })
        .collect();
    Json(serde_json::json!({
        "workspaces": workspaces,
        "terminals": state.sessions.len(),
        "pendingMessages": state.send_buffer.pending_count(),
        "busSubscribers": state.bus.subscriber_count(),
    }))
}

#[cfg(target_os = "linux")]
fn rss_bytes() -> u64 {
    let page_size = 4096u64;
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| statm.split_whitespace().nth(1).and_then(|v| v.parse::<u64>().ok()))
        .map(|pages| pages * page_size)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn rss_bytes() -> u64 {
    0
}
