//! Factory and registry for shellper holders.
//!
//! The manager spawns holder processes detached, reconnects to survivors
//! after a daemon restart, and sweeps sockets whose holders are gone. It
//! also owns the reconciliation flag that disables on-the-fly reconnects
//! while the startup sweep runs.

use crate::error::SpireError;
use crate::shellper::client::ShellperClient;
use dashmap::DashMap;
use spire_types::shellper::RestartPolicy;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

/// Environment variables a holder inherits from the daemon; everything
/// else is scrubbed before request-specific vars are applied.
const ENV_ALLOWLIST: &[&str] =
    &["PATH", "HOME", "USER", "LOGNAME", "SHELL", "LANG", "TMPDIR", "XDG_RUNTIME_DIR"];

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Last observed coordinates of a holder.
#[derive(Debug, Clone)]
pub struct HolderInfo {
    pub socket_path: PathBuf,
    pub holder_pid: u32,
    pub holder_start_time: u64,
}

/// Request to create a new holder-backed session.
pub struct CreateHolderRequest {
    pub session_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    pub restart_policy: Option<RestartPolicy>,
}

pub struct ShellperManager {
    sockets_dir: PathBuf,
    shellper_bin: PathBuf,
    sessions: DashMap<String, HolderInfo>,
    reconciling: AtomicBool,
    meta_timeout: Duration,
}

impl ShellperManager {
    pub fn new(
        sockets_dir: PathBuf,
        shellper_bin: Option<PathBuf>,
        meta_timeout: Duration,
    ) -> crate::Result<Self> {
        std::fs::create_dir_all(&sockets_dir)?;
        let shellper_bin = shellper_bin.unwrap_or_else(default_shellper_bin);
        Ok(Self {
            sockets_dir,
            shellper_bin,
            sessions: DashMap::new(),
            reconciling: AtomicBool::new(false),
            meta_timeout,
        })
    }

    /// While true, request-path holder reconnects must be refused; only
    /// reconciliation may touch existing sockets.
    pub fn is_reconciling(&self) -> bool {
        self.reconciling.load(Ordering::Acquire)
    }

    pub fn set_reconciling(&self, on: bool) {
        self.reconciling.store(on, Ordering::Release);
    }

    fn socket_path(&self, session_id: &str) -> PathBuf {
        self.sockets_dir.join(format!("{}.sock", session_id))
    }

    /// Spawn a holder detached and wait for its meta handshake.
    pub async fn create_session(&self, req: CreateHolderRequest) -> crate::Result<ShellperClient> {
        if self.is_reconciling() {
            return Err(SpireError::Internal(
                "session manager is reconciling; retry shortly".to_string(),
            ));
        }
        let socket_path = self.socket_path(&req.session_id);
        let _ = std::fs::remove_file(&socket_path);

        let mut cmd = tokio::process::Command::new(&self.shellper_bin);
        cmd.arg("--socket")
            .arg(&socket_path)
            .arg("--cwd")
            .arg(&req.cwd)
            .arg("--cols")
            .arg(req.cols.to_string())
            .arg("--rows")
            .arg(req.rows.to_string());
        if let Some(policy) = &req.restart_policy {
            cmd.arg("--max-restarts")
                .arg(policy.max_restarts.to_string())
                .arg("--restart-delay-ms")
                .arg(policy.delay_ms.to_string());
        }
        cmd.arg("--").arg(&req.command).args(&req.args);

        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &req.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        cmd.current_dir(&req.cwd);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| {
            SpireError::HolderSpawnFailed(format!(
                "failed to spawn {}: {}",
                self.shellper_bin.display(),
                e
            ))
        })?;

        // Poll for the socket + meta frame; a holder that dies before the
        // handshake fails fast instead of waiting out the timeout.
        let deadline = tokio::time::Instant::now() + self.meta_timeout;
        let client = loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SpireError::HolderSpawnFailed(format!(
                    "holder exited during startup with {}",
                    status
                )));
            }
            match ShellperClient::connect(&socket_path, Duration::from_millis(200)).await {
                Ok(client) => break client,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(SpireError::HolderSpawnFailed(format!(
                        "no meta frame within {:?}: {}",
                        self.meta_timeout, e
                    )))
                }
            }
        };

        let meta = client.meta();
        info!(
            "holder for session {} up: pid {}, socket {}",
            req.session_id,
            meta.pid,
            socket_path.display()
        );
        self.sessions.insert(
            req.session_id,
            HolderInfo {
                socket_path,
                holder_pid: meta.pid,
                holder_start_time: meta.start_time,
            },
        );
        Ok(client)
    }

    /// Reconnect to an existing holder using recorded coordinates. Returns
    /// `Ok(None)` when the holder is stale (pid recycled or replaced).
    pub async fn reconnect_session(
        &self,
        session_id: &str,
        socket_path: &Path,
        expected_pid: u32,
        expected_start_time: u64,
        restart_policy: Option<RestartPolicy>,
    ) -> crate::Result<Option<ShellperClient>> {
        let client = ShellperClient::reconnect(
            socket_path,
            expected_pid,
            expected_start_time,
            restart_policy,
            RECONNECT_TIMEOUT,
        )
        .await?;
        match client {
            Some(client) => {
                self.sessions.insert(
                    session_id.to_string(),
                    HolderInfo {
                        socket_path: socket_path.to_path_buf(),
                        holder_pid: expected_pid,
                        holder_start_time: expected_start_time,
                    },
                );
                Ok(Some(client))
            }
            None => Ok(None),
        }
    }

    /// Last observed holder coordinates for a session.
    pub fn session_info(&self, session_id: &str) -> Option<HolderInfo> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// Forget a session's holder without touching the process, used when
    /// the session exits on its own.
    pub fn forget(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Remove the manager entry for a session. The actual kill frame goes
    /// through the session's own handle, which clears the holder's restart
    /// policy before signalling the child.
    pub fn kill_session(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!("holder entry for session {} removed", session_id);
        }
    }

    /// Sweep the socket directory for holders that are gone. A live holder
    /// always accepts a connection, so a failed probe means the socket file
    /// is an orphan.
    pub async fn cleanup_stale_sockets(&self) -> usize {
        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.sockets_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read sockets dir {}: {}", self.sockets_dir.display(), e);
                return 0;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "sock") {
                continue;
            }
            let alive = matches!(
                tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(&path)).await,
                Ok(Ok(_))
            );
            if !alive {
                if std::fs::remove_file(&path).is_ok() {
                    info!("removed stale shellper socket {}", path.display());
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Graceful daemon shutdown keeps every socket open on purpose: the OS
    /// closes our ends on exit, holders keep running, and the durable
    /// records let the next daemon reconcile back to them.
    pub fn shutdown(&self) {
        info!(
            "leaving {} holder connection(s) for the next daemon to reclaim",
            self.sessions.len()
        );
    }
}

fn default_shellper_bin() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("spire-shellper");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("spire-shellper")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_socket_sweep_removes_dead_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ShellperManager::new(dir.path().to_path_buf(), None, Duration::from_secs(1)).unwrap();

        // a socket file nobody listens on
        let dead = dir.path().join("dead-session.sock");
        let listener = std::os::unix::net::UnixListener::bind(&dead).unwrap();
        drop(listener);
        assert!(dead.exists());

        // a non-socket file must be left alone
        let stray = dir.path().join("notes.txt");
        std::fs::write(&stray, b"keep me").unwrap();

        let removed = manager.cleanup_stale_sockets().await;
        assert_eq!(removed, 1);
        assert!(!dead.exists());
        assert!(stray.exists());
    }

    #[tokio::test]
    async fn live_sockets_survive_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ShellperManager::new(dir.path().to_path_buf(), None, Duration::from_secs(1)).unwrap();

        let live = dir.path().join("live-session.sock");
        let _listener = tokio::net::UnixListener::bind(&live).unwrap();

        let removed = manager.cleanup_stale_sockets().await;
        assert_eq!(removed, 0);
        assert!(live.exists());
    }

    #[tokio::test]
    async fn spawn_of_missing_binary_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ShellperManager::new(
            dir.path().to_path_buf(),
            Some(PathBuf::from("/nonexistent/spire-shellper")),
            Duration::from_millis(200),
        )
        .unwrap();

        let err = manager
            .create_session(CreateHolderRequest {
                session_id: "s1".to_string(),
                command: "true".to_string(),
                args: vec![],
                cwd: dir.path().to_path_buf(),
                env: vec![],
                cols: 80,
                rows: 24,
                restart_policy: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SpireError::HolderSpawnFailed(_)));
    }

    #[test]
    fn reconciling_flag_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            ShellperManager::new(dir.path().to_path_buf(), None, Duration::from_secs(1)).unwrap();
        assert!(!manager.is_reconciling());
        manager.set_reconciling(true);
        assert!(manager.is_reconciling());
        manager.set_reconciling(false);
        assert!(!manager.is_reconciling());
    }
}
