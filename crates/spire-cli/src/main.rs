//! spire: command-line client for the spire tower daemon.

mod api;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

#[derive(Parser)]
#[command(name = "spire")]
#[command(author, version, about = "spire - supervise agent terminals across workspaces", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// List terminals known to the daemon
    Ls {
        /// Only terminals of this workspace path
        #[arg(short, long)]
        workspace: Option<String>,
    },

    /// Send a message to an agent terminal (`[project:]agent`)
    Send {
        /// Target address, e.g. `myproj:architect` or `builder-bugfix-296`
        to: String,
        /// Message text
        message: Vec<String>,
        /// Write the message verbatim, no formatting
        #[arg(long)]
        raw: bool,
        /// Do not press enter after the message
        #[arg(long)]
        no_enter: bool,
        /// Send Ctrl-C before the message
        #[arg(long)]
        interrupt: bool,
        /// Sender agent name, echoed to the recipient
        #[arg(short, long)]
        from: Option<String>,
        /// Fallback workspace (path or basename) for a project-less target
        #[arg(short, long)]
        workspace: Option<String>,
    },

    /// Attach this terminal to a session (Ctrl-C twice to detach)
    Attach {
        /// Terminal id
        id: String,
    },

    /// Daemon health summary
    Health,
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon in the background
    Start,
    /// Stop the daemon (sessions with holders survive)
    Stop,
    /// Check whether the daemon is running
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "spire_cli=debug,spire_core=debug" } else { "spire_cli=warn" })
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let result = match cli.command {
        Commands::Daemon { action } => match action {
            DaemonAction::Start => commands::daemon::start().await,
            DaemonAction::Stop => commands::daemon::stop().await,
            DaemonAction::Status => commands::daemon::status().await,
        },
        Commands::Ls { workspace } => commands::ls::run(workspace).await,
        Commands::Send { to, message, raw, no_enter, interrupt, from, workspace } => {
            commands::send::run(commands::send::SendArgs {
                to,
                message: message.join(" "),
                raw,
                no_enter,
                interrupt,
                from,
                workspace,
            })
            .await
        }
        Commands::Attach { id } => commands::attach::run(&id).await,
        Commands::Health => commands::health::run().await,
    };

    if let Err(ref e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
    result
}
