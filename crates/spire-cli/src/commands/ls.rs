//! `spire ls`: list terminals.

use crate::api::ApiClient;
use anyhow::Result;
use colored::Colorize;
use spire_types::api::TerminalSummary;

pub async fn run(workspace: Option<String>) -> Result<()> {
    let client = ApiClient::new()?;
    let mut terminals: Vec<TerminalSummary> = client.get("/api/terminals").await?;
    if let Some(filter) = &workspace {
        terminals.retain(|t| t.workspace_path.as_deref() == Some(filter.as_str()));
    }
    if terminals.is_empty() {
        println!("no terminals");
        return Ok(());
    }

    for terminal in terminals {
        let status = match terminal.status.as_str() {
            "running" => terminal.status.green(),
            _ => terminal.status.red(),
        };
        let role = terminal
            .role_id
            .or(terminal.role)
            .map(|r| format!(" [{}]", r))
            .unwrap_or_default();
        let workspace = terminal
            .workspace_path
            .map(|w| format!("  {}", w.dimmed()))
            .unwrap_or_default();
        println!(
            "{}  {}{}  {}{}",
            &terminal.id[..8.min(terminal.id.len())],
            terminal.label.bold(),
            role,
            status,
            workspace
        );
    }
    Ok(())
}
