//! HTTP API bodies and stable error codes.
//!
//! Field names are camelCase on the wire; the dashboard and peer tools
//! treat these shapes as a contract.

use serde::{Deserialize, Serialize};

/// Stable machine-readable error codes for HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidParams,
    NotFound,
    Ambiguous,
    NoContext,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    /// The HTTP status this code maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidParams | ErrorCode::NoContext => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::Ambiguous => 409,
            ErrorCode::RateLimited => 429,
            ErrorCode::InternalError => 500,
        }
    }
}

/// Error envelope returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    /// Closest candidates, filled in when disambiguation failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { error: ErrorDetail { code, message: message.into(), candidates: Vec::new() } }
    }

    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.error.candidates = candidates;
        self
    }
}

/// `POST /api/terminals`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Back the terminal with a shellper holder so it survives daemon
    /// restarts.
    #[serde(default)]
    pub persistent: bool,
    /// Register under this workspace in the terminal registry.
    #[serde(default)]
    pub workspace_path: Option<String>,
    /// Role kind: `architect`, `builder`, or `shell`.
    #[serde(default, rename = "type")]
    pub role: Option<String>,
    /// Stable role key within the workspace (e.g. `builder-bugfix-296`).
    /// Ignored for architects; generated (`shell-N`) for shells when
    /// absent.
    #[serde(default)]
    pub role_id: Option<String>,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// `POST /api/terminals/:id/write`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub data: String,
}

/// `POST /api/terminals/:id/resize`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// `GET /api/terminals/:id/output?since=<seq>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResponse {
    pub lines: Vec<String>,
    pub seq: u64,
    /// True when `since` was older than the ring retains and a full
    /// snapshot was returned instead.
    #[serde(default)]
    pub overflow: bool,
}

/// `POST /api/send`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub to: String,
    pub message: String,
    #[serde(default)]
    pub from: Option<String>,
    /// Fallback workspace for a project-less `to`.
    #[serde(default)]
    pub workspace: Option<String>,
    /// Workspace the sender belongs to, for bus attribution.
    #[serde(default)]
    pub from_workspace: Option<String>,
    #[serde(default)]
    pub options: SendOptions,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub no_enter: bool,
    #[serde(default)]
    pub interrupt: bool,
}

/// `POST /api/send` success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub delivered_to: String,
    pub terminal_id: String,
    /// False when the message was queued behind the typing-aware buffer.
    pub immediate: bool,
}

/// One terminal in list/get responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSummary {
    pub id: String,
    pub label: String,
    pub cwd: String,
    pub status: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub persistent: bool,
    pub current_seq: u64,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default, rename = "type")]
    pub role: Option<String>,
    #[serde(default)]
    pub role_id: Option<String>,
}

/// One known workspace in `GET /api/workspaces`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSummary {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub last_launched_at: Option<chrono::DateTime<chrono::Utc>>,
    /// True when the registry currently holds terminals for it.
    pub active: bool,
    pub terminals: usize,
}

/// One open file tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTabSummary {
    pub id: String,
    pub file_path: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// `POST /api/workspaces/<b64>/tabs`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFileTabRequest {
    pub file_path: String,
}

/// `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub terminals: usize,
    pub workspaces: usize,
    pub rss_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_spec_statuses() {
        assert_eq!(ErrorCode::InvalidParams.http_status(), 400);
        assert_eq!(ErrorCode::NoContext.http_status(), 400);
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::Ambiguous.http_status(), 409);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
        assert_eq!(ErrorCode::InternalError.http_status(), 500);
    }

    #[test]
    fn send_request_accepts_minimal_body() {
        let req: SendRequest =
            serde_json::from_str(r#"{"to":"proj:architect","message":"hi"}"#).unwrap();
        assert_eq!(req.to, "proj:architect");
        assert!(!req.options.raw && !req.options.no_enter && !req.options.interrupt);
    }

    #[test]
    fn create_terminal_uses_wire_field_names() {
        let req: CreateTerminalRequest = serde_json::from_str(
            r#"{"command":"bash","cwd":"/w","persistent":true,
                "workspacePath":"/w","type":"builder","roleId":"builder-x-1"}"#,
        )
        .unwrap();
        assert!(req.persistent);
        assert_eq!(req.role.as_deref(), Some("builder"));
        assert_eq!(req.role_id.as_deref(), Some("builder-x-1"));
        assert_eq!(req.cols, 80);
    }
}
