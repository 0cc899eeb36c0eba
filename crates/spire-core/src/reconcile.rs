//! Startup reconciliation: rebuild in-memory session state from durable
//! records by reconnecting shellper holders, and sweep what cannot be
//! reclaimed.
//!
//! Runs exactly once, before the HTTP surface serves instance-level
//! requests. While it runs, the manager's reconciling flag disables the
//! on-the-fly reconnect path, so a racing request cannot double-claim a
//! holder.

use crate::config::Settings;
use crate::paths::{is_temp_path, pid_alive, send_sigterm};
use crate::registry::{RegisterTerminal, TerminalRegistry};
use crate::session::{PtySession, SessionMap, ShellperSessionOptions};
use crate::shellper::ShellperManager;
use crate::store::{SessionRecord, SessionStore};
use spire_types::RoleKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Counters logged at the end of reconciliation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reconnected: usize,
    pub killed: usize,
    pub stale_cleaned: usize,
    pub stale_sockets_removed: usize,
}

pub async fn reconcile(
    store: &Arc<SessionStore>,
    registry: &Arc<TerminalRegistry>,
    manager: &Arc<ShellperManager>,
    sessions: &SessionMap,
    settings: &Settings,
) -> crate::Result<ReconcileReport> {
    manager.set_reconciling(true);
    let result = run(store, registry, manager, sessions, settings).await;
    manager.set_reconciling(false);
    result
}

async fn run(
    store: &Arc<SessionStore>,
    registry: &Arc<TerminalRegistry>,
    manager: &Arc<ShellperManager>,
    sessions: &SessionMap,
    settings: &Settings,
) -> crate::Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    // Sweep dead sockets before touching live holders: the probe would
    // displace a freshly reconnected client, since a holder adopts every
    // accepted connection as its current client.
    report.stale_sockets_removed = manager.cleanup_stale_sockets().await;

    let records = store.list_sessions().await.map_err(|e| crate::SpireError::Internal(e.to_string()))?;
    info!("reconciliation: {} durable session record(s)", records.len());

    let mut leftovers: Vec<SessionRecord> = Vec::new();

    // Phase A: reconnect holders.
    for record in records {
        if !record.has_holder() {
            leftovers.push(record);
            continue;
        }
        let workspace = PathBuf::from(&record.workspace_path);
        if !workspace_usable(&workspace).await {
            warn!(
                "record {} points at unusable workspace {}; dropping",
                record.id, record.workspace_path
            );
            if let Some(holder_pid) = record.holder_pid {
                if pid_alive(holder_pid) {
                    send_sigterm(holder_pid);
                    report.killed += 1;
                }
            }
            let _ = store.delete_session(&record.id).await;
            report.stale_cleaned += 1;
            continue;
        }

        let socket = PathBuf::from(record.holder_socket.clone().expect("has_holder checked"));
        let holder_pid = record.holder_pid.expect("has_holder checked");
        let holder_start_time = record.holder_start_time.expect("has_holder checked");
        // Architect holders get their restart policy back so the agent
        // process respawns on exit.
        let restart_policy = match record.role {
            RoleKind::Architect => Some(settings.architect_restart),
            _ => None,
        };

        let client = match manager
            .reconnect_session(&record.id, &socket, holder_pid, holder_start_time, restart_policy)
            .await
        {
            Ok(Some(client)) => client,
            Ok(None) => {
                info!("record {}: holder is stale", record.id);
                leftovers.push(record);
                continue;
            }
            Err(e) => {
                warn!("record {}: holder reconnect failed: {}", record.id, e);
                leftovers.push(record);
                continue;
            }
        };

        let meta = client.meta().clone();
        let (events, seed) = client.subscribe();
        let handle = client.handle();
        let label = record.role_id.clone().unwrap_or_else(|| record.role.to_string());
        let session = PtySession::from_shellper(
            ShellperSessionOptions {
                id: None,
                label,
                cwd: workspace.clone(),
                cols: 80,
                rows: 24,
                ring_capacity: settings.ring_capacity,
                kill_grace: settings.kill_grace(),
            },
            handle,
            meta.pid,
            seed,
            events,
        );

        // The old id is rewritten to the fresh session id, then the
        // registry write-through replaces the row in full.
        if let Err(e) = store.rewrite_session_id(&record.id, &session.id).await {
            warn!("record {}: id rewrite failed: {}", record.id, e);
        }
        registry.activate_workspace(&workspace).await?;
        registry
            .register_terminal(RegisterTerminal {
                workspace: workspace.clone(),
                role: record.role,
                role_key: record.role_id.clone(),
                session_id: session.id.clone(),
                pid: Some(meta.pid),
                holder_socket: Some(socket.to_string_lossy().to_string()),
                holder_pid: Some(meta.pid),
                holder_start_time: Some(meta.start_time),
            })
            .await?;
        sessions.insert(session.id.clone(), session.clone());
        wire_exit_cleanup(session.clone(), registry.clone(), sessions.clone(), manager.clone());
        report.reconnected += 1;
        info!("reconnected session {} (was {}) via holder pid {}", session.id, record.id, meta.pid);
    }

    // Phase B: stale sweep of everything not reconnected.
    for record in leftovers {
        if let Some(pid) = record.pid {
            if pid_alive(pid) {
                send_sigterm(pid);
                report.killed += 1;
            }
        }
        let _ = store.delete_session(&record.id).await;
        report.stale_cleaned += 1;
    }

    info!(
        "reconciliation done: {} reconnected, {} killed, {} stale records cleaned, {} stale sockets removed",
        report.reconnected, report.killed, report.stale_cleaned, report.stale_sockets_removed
    );
    Ok(report)
}

async fn workspace_usable(path: &Path) -> bool {
    if is_temp_path(path) {
        return false;
    }
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_dir())
}

/// Tie a session's exit to cleanup: delete the durable record, unregister
/// from the registry, drop the live map entry, and forget its holder.
pub fn wire_exit_cleanup(
    session: Arc<PtySession>,
    registry: Arc<TerminalRegistry>,
    sessions: SessionMap,
    manager: Arc<ShellperManager>,
) {
    tokio::spawn(async move {
        session.wait_exit().await;
        registry.unregister_terminal(&session.id).await;
        sessions.remove(&session.id);
        manager.forget(&session.id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionRecord;
    use chrono::Utc;
    use std::time::Duration;

    struct WorkspaceDir(PathBuf);

    impl WorkspaceDir {
        fn create(tag: &str) -> Self {
            let path = std::env::current_dir()
                .unwrap()
                .join(format!(".reconcile-test-{}-{}", tag, std::process::id()));
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }
    }

    impl Drop for WorkspaceDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn record(id: &str, workspace: &Path, holder: bool) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            workspace_path: workspace.to_string_lossy().to_string(),
            role: RoleKind::Shell,
            role_id: Some("shell-1".to_string()),
            pid: None,
            holder_socket: holder.then(|| "/nonexistent/holder.sock".to_string()),
            holder_pid: holder.then_some(4_000_000),
            holder_start_time: holder.then_some(1),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unreachable_holders_and_dead_records_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(SessionStore::open(&dir.path().join("spire.db")).await.unwrap());
        let registry = Arc::new(TerminalRegistry::new(store.clone()));
        let manager = Arc::new(
            ShellperManager::new(dir.path().join("sockets"), None, Duration::from_millis(300))
                .unwrap(),
        );
        let sessions: SessionMap = Arc::new(dashmap::DashMap::new());
        let ws = WorkspaceDir::create("sweep");

        // holder socket is gone -> reconnect fails -> Phase B sweep
        store.insert_session(&record("a", &ws.0, true)).await.unwrap();
        // plain record without holder coordinates -> Phase B directly
        store.insert_session(&record("b", &ws.0, false)).await.unwrap();
        // record pointing at a workspace that no longer exists
        store
            .insert_session(&record("c", Path::new("/nonexistent/workspace"), true))
            .await
            .unwrap();

        let report =
            reconcile(&store, &registry, &manager, &sessions, &Settings::default()).await.unwrap();

        assert_eq!(report.reconnected, 0);
        assert_eq!(report.stale_cleaned, 3);
        assert!(store.list_sessions().await.unwrap().is_empty());
        assert!(sessions.is_empty());
        assert!(!manager.is_reconciling());
    }

    #[tokio::test]
    async fn temp_workspace_records_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(SessionStore::open(&dir.path().join("spire.db")).await.unwrap());
        let registry = Arc::new(TerminalRegistry::new(store.clone()));
        let manager = Arc::new(
            ShellperManager::new(dir.path().join("sockets"), None, Duration::from_millis(300))
                .unwrap(),
        );
        let sessions: SessionMap = Arc::new(dashmap::DashMap::new());

        let temp_ws = std::env::temp_dir().join("spire-reconcile-temp");
        std::fs::create_dir_all(&temp_ws).unwrap();
        store.insert_session(&record("t", &temp_ws, true)).await.unwrap();

        let report =
            reconcile(&store, &registry, &manager, &sessions, &Settings::default()).await.unwrap();
        assert_eq!(report.reconnected, 0);
        assert_eq!(report.stale_cleaned, 1);
        assert!(store.list_sessions().await.unwrap().is_empty());
    }
}
