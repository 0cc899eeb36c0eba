//! `spire health`: daemon health summary.

use crate::api::ApiClient;
use anyhow::Result;
use colored::Colorize;
use spire_types::api::HealthResponse;

pub async fn run() -> Result<()> {
    let client = ApiClient::new()?;
    let health: HealthResponse = client.get("/health").await?;
    println!("{} spired v{}", "✓".green(), health.version);
    println!("  uptime:     {}s", health.uptime_secs);
    println!("  terminals:  {}", health.terminals);
    println!("  workspaces: {}", health.workspaces);
    if health.rss_bytes > 0 {
        println!("  rss:        {} MiB", health.rss_bytes / (1024 * 1024));
    }
    Ok(())
}
