//! `spire send`: deliver a message to an agent terminal.

use crate::api::ApiClient;
use anyhow::Result;
use colored::Colorize;
use spire_types::api::{SendOptions, SendRequest, SendResponse};

pub struct SendArgs {
    pub to: String,
    pub message: String,
    pub raw: bool,
    pub no_enter: bool,
    pub interrupt: bool,
    pub from: Option<String>,
    pub workspace: Option<String>,
}

pub async fn run(args: SendArgs) -> Result<()> {
    if args.message.is_empty() {
        anyhow::bail!("message must not be empty");
    }
    let client = ApiClient::new()?;
    let workspace = match args.workspace {
        Some(ws) => Some(ws),
        // default the fallback workspace to the current directory
        None => std::env::current_dir().ok().map(|p| p.to_string_lossy().to_string()),
    };
    let response: SendResponse = client
        .post(
            "/api/send",
            &SendRequest {
                to: args.to,
                message: args.message,
                from: args.from,
                workspace,
                from_workspace: None,
                options: SendOptions {
                    raw: args.raw,
                    no_enter: args.no_enter,
                    interrupt: args.interrupt,
                },
            },
        )
        .await?;

    let mode = if response.immediate { "delivered" } else { "queued (recipient is typing)" };
    println!("{} {} to {}", "✓".green(), mode, response.delivered_to.bold());
    Ok(())
}
