//! Terminal registry: canonical workspace → live terminals, mirrored to
//! the durable store on every mutation.
//!
//! Reads are served from memory; the store is consulted only during
//! reconciliation and to hydrate a workspace's file tabs on first touch in
//! a daemon lifetime. Lock order is registry-then-store, and store writes
//! happen only inside write-through operations.

use crate::error::SpireError;
use crate::paths::{is_temp_path, workspace_basename};
use crate::store::{FileTabRecord, KnownWorkspace, SessionRecord, SessionStore};
use chrono::{DateTime, Utc};
use spire_types::RoleKind;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

/// One open file tab.
#[derive(Debug, Clone)]
pub struct FileTab {
    pub id: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

/// Live terminals of one workspace.
#[derive(Debug, Default)]
pub struct WorkspaceEntry {
    pub architect: Option<String>,
    /// role key → session id
    pub builders: BTreeMap<String, String>,
    pub shells: BTreeMap<String, String>,
    pub file_tabs: HashMap<String, FileTab>,
    tabs_hydrated: bool,
}

impl WorkspaceEntry {
    pub fn terminal_ids(&self) -> Vec<String> {
        self.architect
            .iter()
            .cloned()
            .chain(self.builders.values().cloned())
            .chain(self.shells.values().cloned())
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.architect.is_some() as usize + self.builders.len() + self.shells.len()
    }

    /// Role and key of a session id, if registered here.
    pub fn role_of(&self, session_id: &str) -> Option<(RoleKind, Option<String>)> {
        if self.architect.as_deref() == Some(session_id) {
            return Some((RoleKind::Architect, None));
        }
        for (key, id) in &self.builders {
            if id == session_id {
                return Some((RoleKind::Builder, Some(key.clone())));
            }
        }
        for (key, id) in &self.shells {
            if id == session_id {
                return Some((RoleKind::Shell, Some(key.clone())));
            }
        }
        None
    }
}

/// A terminal registration, written through to the store.
pub struct RegisterTerminal {
    pub workspace: PathBuf,
    pub role: RoleKind,
    /// Required for builders; generated for shells when absent; ignored
    /// for architects.
    pub role_key: Option<String>,
    pub session_id: String,
    pub pid: Option<u32>,
    pub holder_socket: Option<String>,
    pub holder_pid: Option<u32>,
    pub holder_start_time: Option<u64>,
}

pub struct TerminalRegistry {
    entries: RwLock<HashMap<PathBuf, WorkspaceEntry>>,
    store: Arc<SessionStore>,
}

impl TerminalRegistry {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { entries: RwLock::new(HashMap::new()), store }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Read access for resolution and listing.
    pub async fn read(&self) -> RwLockReadGuard<'_, HashMap<PathBuf, WorkspaceEntry>> {
        self.entries.read().await
    }

    /// Mark a workspace active: ensure its entry exists (hydrating file
    /// tabs from the store on first touch) and stamp it as known. Temp
    /// workspaces get an in-memory entry but are never persisted.
    pub async fn activate_workspace(&self, workspace: &Path) -> crate::Result<()> {
        let persist = !is_temp_path(workspace);
        let mut entries = self.entries.write().await;
        let entry = entries.entry(workspace.to_path_buf()).or_default();
        if persist && !entry.tabs_hydrated {
            entry.tabs_hydrated = true;
            match self.store.list_file_tabs(&workspace.to_string_lossy()).await {
                Ok(tabs) => {
                    for tab in tabs {
                        entry.file_tabs.insert(
                            tab.id.clone(),
                            FileTab {
                                id: tab.id,
                                file_path: tab.file_path,
                                created_at: tab.created_at,
                            },
                        );
                    }
                }
                Err(e) => warn!("failed to hydrate file tabs for {}: {}", workspace.display(), e),
            }
        }
        if persist {
            self.store
                .upsert_known_workspace(&KnownWorkspace {
                    workspace_path: workspace.to_string_lossy().to_string(),
                    name: workspace_basename(workspace),
                    last_launched_at: Utc::now(),
                })
                .await
                .map_err(|e| SpireError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn is_active(&self, workspace: &Path) -> bool {
        self.entries.read().await.contains_key(workspace)
    }

    /// Register a live terminal and write its durable record. Refuses when
    /// the workspace has been deactivated in the meantime, so a racing
    /// stop cannot leave a zombie row behind. Returns the effective role
    /// key.
    pub async fn register_terminal(&self, reg: RegisterTerminal) -> crate::Result<Option<String>> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&reg.workspace) else {
            return Err(SpireError::not_found(format!(
                "workspace {} is not active",
                reg.workspace.display()
            )));
        };

        let role_key = match reg.role {
            RoleKind::Architect => {
                entry.architect = Some(reg.session_id.clone());
                None
            }
            RoleKind::Builder => {
                let key = reg
                    .role_key
                    .clone()
                    .ok_or_else(|| {
                        SpireError::InvalidParams("builder terminals need a roleId".to_string())
                    })?
                    .to_lowercase();
                entry.builders.insert(key.clone(), reg.session_id.clone());
                Some(key)
            }
            RoleKind::Shell => {
                let key = match reg.role_key.clone() {
                    Some(key) => key.to_lowercase(),
                    None => next_shell_key(entry),
                };
                entry.shells.insert(key.clone(), reg.session_id.clone());
                Some(key)
            }
        };

        if !is_temp_path(&reg.workspace) {
            self.store
                .insert_session(&SessionRecord {
                    id: reg.session_id.clone(),
                    workspace_path: reg.workspace.to_string_lossy().to_string(),
                    role: reg.role,
                    role_id: role_key.clone(),
                    pid: reg.pid,
                    holder_socket: reg.holder_socket.clone(),
                    holder_pid: reg.holder_pid,
                    holder_start_time: reg.holder_start_time,
                    created_at: Utc::now(),
                })
                .await
                .map_err(|e| SpireError::Internal(e.to_string()))?;
        }
        debug!(
            "registered {} terminal {} in {}",
            reg.role,
            reg.session_id,
            reg.workspace.display()
        );
        Ok(role_key)
    }

    /// Drop a terminal from whichever slot holds it and delete its record.
    pub async fn unregister_terminal(&self, session_id: &str) {
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut() {
            if entry.architect.as_deref() == Some(session_id) {
                entry.architect = None;
            }
            entry.builders.retain(|_, id| id != session_id);
            entry.shells.retain(|_, id| id != session_id);
        }
        if let Err(e) = self.store.delete_session(session_id).await {
            warn!("failed to delete session record {}: {}", session_id, e);
        }
    }

    /// `shell-N` where N is one above the highest registered suffix.
    pub async fn next_shell_id(&self, workspace: &Path) -> String {
        let entries = self.entries.read().await;
        match entries.get(workspace) {
            Some(entry) => next_shell_key(entry),
            None => "shell-1".to_string(),
        }
    }

    /// Workspaces whose basename matches the lowercased project name.
    pub async fn find_workspaces(&self, project: &str) -> Vec<PathBuf> {
        self.entries
            .read()
            .await
            .keys()
            .filter(|path| workspace_basename(path) == project)
            .cloned()
            .collect()
    }

    /// Remove a workspace entry, returning the session ids it held. The
    /// caller kills those sessions; their exit hooks delete the records.
    pub async fn remove_workspace(&self, workspace: &Path) -> Vec<String> {
        let mut entries = self.entries.write().await;
        entries.remove(workspace).map(|entry| entry.terminal_ids()).unwrap_or_default()
    }

    pub async fn open_file_tab(&self, workspace: &Path, file_path: &str) -> crate::Result<FileTab> {
        let tab = FileTab {
            id: uuid::Uuid::new_v4().to_string(),
            file_path: file_path.to_string(),
            created_at: Utc::now(),
        };
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(workspace) else {
            return Err(SpireError::not_found(format!(
                "workspace {} is not active",
                workspace.display()
            )));
        };
        entry.file_tabs.insert(tab.id.clone(), tab.clone());
        if !is_temp_path(workspace) {
            self.store
                .insert_file_tab(&FileTabRecord {
                    id: tab.id.clone(),
                    workspace_path: workspace.to_string_lossy().to_string(),
                    file_path: tab.file_path.clone(),
                    created_at: tab.created_at,
                })
                .await
                .map_err(|e| SpireError::Internal(e.to_string()))?;
        }
        Ok(tab)
    }

    pub async fn close_file_tab(&self, workspace: &Path, tab_id: &str) -> crate::Result<()> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(workspace) else {
            return Err(SpireError::not_found(format!(
                "workspace {} is not active",
                workspace.display()
            )));
        };
        entry.file_tabs.remove(tab_id);
        if !is_temp_path(workspace) {
            self.store
                .delete_file_tab(tab_id)
                .await
                .map_err(|e| SpireError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn total_terminals(&self) -> usize {
        self.entries.read().await.values().map(|e| e.terminal_count()).sum()
    }

    /// Workspace and role of a registered session id.
    pub async fn locate(&self, session_id: &str) -> Option<(PathBuf, RoleKind, Option<String>)> {
        let entries = self.entries.read().await;
        for (path, entry) in entries.iter() {
            if let Some((role, key)) = entry.role_of(session_id) {
                return Some((path.clone(), role, key));
            }
        }
        None
    }
}

fn next_shell_key(entry: &WorkspaceEntry) -> String {
    let max = entry
        .shells
        .keys()
        .filter_map(|key| key.strip_prefix("shell-"))
        .filter_map(|suffix| suffix.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("shell-{}", max + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> (tempfile::TempDir, TerminalRegistry, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(&dir.path().join("spire.db")).await.unwrap());
        let registry = TerminalRegistry::new(store);
        // a workspace outside the temp root so write-through is exercised
        let workspace = PathBuf::from("/home/dev/alpha");
        registry.activate_workspace(&workspace).await.unwrap();
        (dir, registry, workspace)
    }

    fn reg(workspace: &Path, role: RoleKind, key: Option<&str>, id: &str) -> RegisterTerminal {
        RegisterTerminal {
            workspace: workspace.to_path_buf(),
            role,
            role_key: key.map(|s| s.to_string()),
            session_id: id.to_string(),
            pid: Some(100),
            holder_socket: None,
            holder_pid: None,
            holder_start_time: None,
        }
    }

    #[tokio::test]
    async fn register_writes_through_to_store() {
        let (_dir, registry, ws) = registry().await;
        registry
            .register_terminal(reg(&ws, RoleKind::Builder, Some("builder-bugfix-296"), "b1"))
            .await
            .unwrap();

        let rows = registry.store().list_sessions().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "b1");
        assert_eq!(rows[0].role, RoleKind::Builder);

        registry.unregister_terminal("b1").await;
        assert!(registry.store().list_sessions().await.unwrap().is_empty());
        assert_eq!(registry.total_terminals().await, 0);
    }

    #[tokio::test]
    async fn register_refuses_inactive_workspace() {
        let (_dir, registry, _ws) = registry().await;
        let gone = PathBuf::from("/home/dev/removed");
        let err = registry
            .register_terminal(reg(&gone, RoleKind::Shell, None, "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SpireError::NotFound { .. }));
        // no zombie row either
        assert!(registry.store().list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shell_ids_increment_past_the_max() {
        let (_dir, registry, ws) = registry().await;
        assert_eq!(registry.next_shell_id(&ws).await, "shell-1");
        registry.register_terminal(reg(&ws, RoleKind::Shell, None, "s1")).await.unwrap();
        registry
            .register_terminal(reg(&ws, RoleKind::Shell, Some("shell-7"), "s7"))
            .await
            .unwrap();
        assert_eq!(registry.next_shell_id(&ws).await, "shell-8");
    }

    #[tokio::test]
    async fn temp_workspaces_are_never_persisted() {
        let (_dir, registry, _ws) = registry().await;
        let temp_ws = std::env::temp_dir().join("spire-scratch");
        registry.activate_workspace(&temp_ws).await.unwrap();
        registry
            .register_terminal(reg(&temp_ws, RoleKind::Shell, None, "tmp1"))
            .await
            .unwrap();

        assert!(registry.store().list_sessions().await.unwrap().is_empty());
        assert!(registry.store().list_known_workspaces().await.unwrap().iter().all(|w| {
            w.workspace_path != temp_ws.to_string_lossy()
        }));
        // but it is live in memory
        assert_eq!(registry.total_terminals().await, 1);
    }

    #[tokio::test]
    async fn file_tabs_hydrate_on_first_touch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(&dir.path().join("spire.db")).await.unwrap());
        let ws = PathBuf::from("/home/dev/alpha");
        store
            .insert_file_tab(&FileTabRecord {
                id: "t1".to_string(),
                workspace_path: ws.to_string_lossy().to_string(),
                file_path: "/home/dev/alpha/src/lib.rs".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let registry = TerminalRegistry::new(store);
        registry.activate_workspace(&ws).await.unwrap();
        let entries = registry.read().await;
        assert_eq!(entries.get(&ws).unwrap().file_tabs.len(), 1);
    }

    #[tokio::test]
    async fn locate_finds_roles() {
        let (_dir, registry, ws) = registry().await;
        registry.register_terminal(reg(&ws, RoleKind::Architect, None, "a1")).await.unwrap();
        let (path, role, key) = registry.locate("a1").await.unwrap();
        assert_eq!(path, ws);
        assert_eq!(role, RoleKind::Architect);
        assert!(key.is_none());
        assert!(registry.locate("missing").await.is_none());
    }
}
