//! Durable record store: one SQLite file holding session records, file
//! tabs, and known workspaces.
//!
//! The registry writes through to this store on every mutation; reads go
//! to the in-memory maps except during reconciliation and first-touch
//! hydration, so the query surface here stays deliberately small.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use spire_types::RoleKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;

/// One durable session row.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub workspace_path: String,
    pub role: RoleKind,
    pub role_id: Option<String>,
    pub pid: Option<u32>,
    pub holder_socket: Option<String>,
    pub holder_pid: Option<u32>,
    pub holder_start_time: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn has_holder(&self) -> bool {
        self.holder_socket.is_some() && self.holder_pid.is_some() && self.holder_start_time.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct FileTabRecord {
    pub id: String,
    pub workspace_path: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct KnownWorkspace {
    pub workspace_path: String,
    pub name: String,
    pub last_launched_at: DateTime<Utc>,
}

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub async fn open(database_path: &Path) -> Result<Self> {
        if let Some(parent) = database_path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open store at {}", database_path.display()))?;

        Self::run_migrations(&pool).await.context("Failed to run store migrations")?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS terminal_sessions (
                id TEXT PRIMARY KEY,
                workspace_path TEXT NOT NULL,
                type TEXT NOT NULL,
                role_id TEXT,
                pid INTEGER,
                holder_socket TEXT,
                holder_pid INTEGER,
                holder_start_time INTEGER,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_tabs (
                id TEXT PRIMARY KEY,
                workspace_path TEXT NOT NULL,
                file_path TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS known_workspaces (
                workspace_path TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                last_launched_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    // Session records

    pub async fn insert_session(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO terminal_sessions
                (id, workspace_path, type, role_id, pid,
                 holder_socket, holder_pid, holder_start_time, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&record.id)
        .bind(&record.workspace_path)
        .bind(record.role.as_str())
        .bind(&record.role_id)
        .bind(record.pid.map(|p| p as i64))
        .bind(&record.holder_socket)
        .bind(record.holder_pid.map(|p| p as i64))
        .bind(record.holder_start_time.map(|t| t as i64))
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update a record's process/holder coordinates after a shellper
    /// attach or reconnect.
    pub async fn update_holder(
        &self,
        id: &str,
        pid: Option<u32>,
        holder_socket: Option<&str>,
        holder_pid: Option<u32>,
        holder_start_time: Option<u64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE terminal_sessions
            SET pid = ?2, holder_socket = ?3, holder_pid = ?4, holder_start_time = ?5
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(pid.map(|p| p as i64))
        .bind(holder_socket)
        .bind(holder_pid.map(|p| p as i64))
        .bind(holder_start_time.map(|t| t as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rewrite a record under a new session id (reconciliation rebinds the
    /// old row to the freshly built session, it never duplicates it).
    pub async fn rewrite_session_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        sqlx::query("UPDATE terminal_sessions SET id = ?2 WHERE id = ?1")
            .bind(old_id)
            .bind(new_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM terminal_sessions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM terminal_sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(session_from_row).transpose()
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT * FROM terminal_sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    pub async fn list_sessions_for_workspace(&self, workspace: &str) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM terminal_sessions WHERE workspace_path = ?1 ORDER BY created_at",
        )
        .bind(workspace)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    // File tabs

    pub async fn insert_file_tab(&self, tab: &FileTabRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO file_tabs (id, workspace_path, file_path, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&tab.id)
        .bind(&tab.workspace_path)
        .bind(&tab.file_path)
        .bind(tab.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_file_tab(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM file_tabs WHERE id = ?1").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn list_file_tabs(&self, workspace: &str) -> Result<Vec<FileTabRecord>> {
        let rows = sqlx::query("SELECT * FROM file_tabs WHERE workspace_path = ?1 ORDER BY created_at")
            .bind(workspace)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(FileTabRecord {
                    id: row.get("id"),
                    workspace_path: row.get("workspace_path"),
                    file_path: row.get("file_path"),
                    created_at: parse_timestamp(row.get("created_at")),
                })
            })
            .collect()
    }

    // Known workspaces

    pub async fn upsert_known_workspace(&self, workspace: &KnownWorkspace) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO known_workspaces (workspace_path, name, last_launched_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(workspace_path)
            DO UPDATE SET name = excluded.name, last_launched_at = excluded.last_launched_at
            "#,
        )
        .bind(&workspace.workspace_path)
        .bind(&workspace.name)
        .bind(workspace.last_launched_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_known_workspaces(&self) -> Result<Vec<KnownWorkspace>> {
        let rows = sqlx::query("SELECT * FROM known_workspaces ORDER BY last_launched_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| KnownWorkspace {
                workspace_path: row.get("workspace_path"),
                name: row.get("name"),
                last_launched_at: parse_timestamp(row.get("last_launched_at")),
            })
            .collect())
    }

    pub async fn delete_known_workspace(&self, workspace: &str) -> Result<()> {
        sqlx::query("DELETE FROM known_workspaces WHERE workspace_path = ?1")
            .bind(workspace)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn session_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SessionRecord> {
    let role_str: String = row.get("type");
    let role = RoleKind::parse(&role_str)
        .with_context(|| format!("unknown session role in store: {}", role_str))?;
    Ok(SessionRecord {
        id: row.get("id"),
        workspace_path: row.get("workspace_path"),
        role,
        role_id: row.get("role_id"),
        pid: row.get::<Option<i64>, _>("pid").map(|p| p as u32),
        holder_socket: row.get("holder_socket"),
        holder_pid: row.get::<Option<i64>, _>("holder_pid").map(|p| p as u32),
        holder_start_time: row.get::<Option<i64>, _>("holder_start_time").map(|t| t as u64),
        created_at: parse_timestamp(row.get("created_at")),
    })
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("spire.db")).await.unwrap();
        (dir, store)
    }

    fn record(id: &str, workspace: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            workspace_path: workspace.to_string(),
            role: RoleKind::Builder,
            role_id: Some("builder-bugfix-296".to_string()),
            pid: Some(1234),
            holder_socket: Some("/run/spire/s.sock".to_string()),
            holder_pid: Some(4321),
            holder_start_time: Some(1_700_000_000),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn session_records_round_trip() {
        let (_dir, store) = store().await;
        let rec = record("s1", "/home/dev/proj");
        store.insert_session(&rec).await.unwrap();

        let back = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(back.workspace_path, "/home/dev/proj");
        assert_eq!(back.role, RoleKind::Builder);
        assert_eq!(back.role_id.as_deref(), Some("builder-bugfix-296"));
        assert_eq!(back.holder_pid, Some(4321));
        assert!(back.has_holder());
    }

    #[tokio::test]
    async fn rewrite_session_id_moves_not_duplicates() {
        let (_dir, store) = store().await;
        store.insert_session(&record("old", "/w")).await.unwrap();
        store.rewrite_session_id("old", "new").await.unwrap();

        assert!(store.get_session("old").await.unwrap().is_none());
        assert!(store.get_session("new").await.unwrap().is_some());
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_session_is_idempotent() {
        let (_dir, store) = store().await;
        store.insert_session(&record("s1", "/w")).await.unwrap();
        store.delete_session("s1").await.unwrap();
        store.delete_session("s1").await.unwrap();
        assert!(store.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_tabs_live_independently() {
        let (_dir, store) = store().await;
        store
            .insert_file_tab(&FileTabRecord {
                id: "t1".to_string(),
                workspace_path: "/w".to_string(),
                file_path: "/w/src/main.rs".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let tabs = store.list_file_tabs("/w").await.unwrap();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].file_path, "/w/src/main.rs");

        store.delete_file_tab("t1").await.unwrap();
        assert!(store.list_file_tabs("/w").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn known_workspaces_upsert() {
        let (_dir, store) = store().await;
        let ws = KnownWorkspace {
            workspace_path: "/w".to_string(),
            name: "w".to_string(),
            last_launched_at: Utc::now(),
        };
        store.upsert_known_workspace(&ws).await.unwrap();
        store.upsert_known_workspace(&ws).await.unwrap();
        assert_eq!(store.list_known_workspaces().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn holder_update_clears_and_sets() {
        let (_dir, store) = store().await;
        store.insert_session(&record("s1", "/w")).await.unwrap();
        store.update_holder("s1", Some(99), None, None, None).await.unwrap();
        let back = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(back.pid, Some(99));
        assert!(!back.has_holder());
    }
}
