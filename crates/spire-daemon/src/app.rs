//! Daemon wiring: shared state and the terminal-creation path used by the
//! HTTP handlers.

use spire_core::config::Settings;
use spire_core::dispatch::{Dispatcher, MessageBus, SendBuffer};
use spire_core::paths::{canonicalize_workspace, is_temp_path};
use spire_core::reconcile::wire_exit_cleanup;
use spire_core::registry::{RegisterTerminal, TerminalRegistry};
use spire_core::session::{PtySession, SessionMap, ShellperSessionOptions, SpawnOptions};
use spire_core::shellper::{CreateHolderRequest, ShellperManager};
use spire_core::store::SessionStore;
use spire_core::SpireError;
use spire_types::api::{CreateTerminalRequest, TerminalSummary};
use spire_types::RoleKind;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<SessionStore>,
    pub registry: Arc<TerminalRegistry>,
    pub manager: Arc<ShellperManager>,
    pub sessions: SessionMap,
    pub dispatcher: Arc<Dispatcher>,
    pub bus: Arc<MessageBus>,
    pub send_buffer: Arc<SendBuffer>,
    pub started_at: Instant,
    pub web_key: Option<Arc<String>>,
    pub activate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Fixed-window rate limiter keyed by client address.
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    buckets: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self { max_per_window, window, buckets: Mutex::new(HashMap::new()) }
    }

    pub fn check(&self, client: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        let now = Instant::now();
        let bucket = buckets.entry(client).or_insert((now, 0));
        if now.duration_since(bucket.0) >= self.window {
            *bucket = (now, 0);
        }
        if bucket.1 >= self.max_per_window {
            return false;
        }
        bucket.1 += 1;
        true
    }
}

/// Create a terminal from an API request: local PTY or shellper-backed,
/// optionally registered under a workspace role.
pub async fn create_terminal(
    state: &AppState,
    req: CreateTerminalRequest,
) -> spire_core::Result<Arc<PtySession>> {
    let cwd = canonicalize_workspace(&PathBuf::from(&req.cwd))?;
    if is_temp_path(&cwd) {
        return Err(SpireError::InvalidParams(format!(
            "refusing to spawn a terminal in temp directory {}",
            cwd.display()
        )));
    }

    let role = match req.role.as_deref() {
        None => None,
        Some(raw) => Some(
            RoleKind::parse(raw)
                .ok_or_else(|| SpireError::InvalidParams(format!("unknown terminal type {:?}", raw)))?,
        ),
    };
    let workspace = match &req.workspace_path {
        Some(path) => {
            let workspace = canonicalize_workspace(&PathBuf::from(path))?;
            state.registry.activate_workspace(&workspace).await?;
            Some(workspace)
        }
        None => None,
    };
    if role.is_some() && workspace.is_none() {
        return Err(SpireError::InvalidParams(
            "a typed terminal needs a workspacePath".to_string(),
        ));
    }

    let label = req
        .role_id
        .clone()
        .or_else(|| role.map(|r| r.to_string()))
        .unwrap_or_else(|| req.command.clone());

    let session = if req.persistent {
        let session_id = uuid::Uuid::new_v4().to_string();
        // Architects restart their process on exit so the workspace is
        // never silently headless.
        let restart_policy = match role {
            Some(RoleKind::Architect) => Some(state.settings.architect_restart),
            _ => None,
        };
        let client = state
            .manager
            .create_session(CreateHolderRequest {
                session_id: session_id.clone(),
                command: req.command.clone(),
                args: req.args.clone(),
                cwd: cwd.clone(),
                env: req.env.clone(),
                cols: req.cols,
                rows: req.rows,
                restart_policy,
            })
            .await?;
        let meta = client.meta().clone();
        let (events, seed) = client.subscribe();
        let handle = client.handle();
        PtySession::from_shellper(
            ShellperSessionOptions {
                id: Some(session_id),
                label,
                cwd: cwd.clone(),
                cols: req.cols,
                rows: req.rows,
                ring_capacity: state.settings.ring_capacity,
                kill_grace: state.settings.kill_grace(),
            },
            handle,
            meta.pid,
            seed,
            events,
        )
    } else {
        PtySession::spawn_local(SpawnOptions {
            id: None,
            label,
            command: req.command.clone(),
            args: req.args.clone(),
            cwd: cwd.clone(),
            env: req.env.clone(),
            cols: req.cols,
            rows: req.rows,
            ring_capacity: state.settings.ring_capacity,
            kill_grace: state.settings.kill_grace(),
        })?
    };

    if let (Some(role), Some(workspace)) = (role, workspace.as_ref()) {
        let holder = state.manager.session_info(&session.id);
        let role_key = match role {
            RoleKind::Shell if req.role_id.is_none() => None,
            _ => req.role_id.clone(),
        };
        state
            .registry
            .register_terminal(RegisterTerminal {
                workspace: workspace.clone(),
                role,
                role_key,
                session_id: session.id.clone(),
                pid: session.pid(),
                holder_socket: holder
                    .as_ref()
                    .map(|h| h.socket_path.to_string_lossy().to_string()),
                holder_pid: holder.as_ref().map(|h| h.holder_pid),
                holder_start_time: holder.as_ref().map(|h| h.holder_start_time),
            })
            .await?;
    }

    state.sessions.insert(session.id.clone(), session.clone());
    wire_exit_cleanup(
        session.clone(),
        state.registry.clone(),
        state.sessions.clone(),
        state.manager.clone(),
    );
    info!(
        "created {} terminal {} in {}",
        if req.persistent { "persistent" } else { "local" },
        session.id,
        cwd.display()
    );
    Ok(session)
}

/// Kill a terminal and drop its holder bookkeeping.
pub async fn kill_terminal(state: &AppState, session: &Arc<PtySession>) {
    state.manager.kill_session(&session.id);
    session.kill();
}

pub async fn summarize(state: &AppState, session: &Arc<PtySession>) -> TerminalSummary {
    let located = state.registry.locate(&session.id).await;
    let (cols, rows) = session.size();
    TerminalSummary {
        id: session.id.clone(),
        label: session.label.clone(),
        cwd: session.cwd.to_string_lossy().to_string(),
        status: session.status().as_str().to_string(),
        exit_code: session.exit_info().and_then(|e| e.code),
        pid: session.pid(),
        cols,
        rows,
        persistent: session.is_persistent(),
        current_seq: session.current_seq(),
        workspace_path: located.as_ref().map(|(ws, _, _)| ws.to_string_lossy().to_string()),
        role: located.as_ref().map(|(_, role, _)| role.to_string()),
        role_id: located.and_then(|(_, _, key)| key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_enforces_the_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let client: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.check(client));
        assert!(limiter.check(client));
        assert!(limiter.check(client));
        assert!(!limiter.check(client));

        // a different client has its own bucket
        let other: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiter.check(other));
    }
}
