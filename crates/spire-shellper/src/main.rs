//! spire-shellper: tiny detached helper that owns a pseudoterminal on
//! behalf of a session record, so the session survives daemon restarts.
//!
//! The daemon spawns one holder per persistent session and talks to it
//! over a Unix-domain socket; see the `holder` module for the protocol
//! loop.

mod holder;

use anyhow::Result;
use clap::Parser;
use spire_types::shellper::RestartPolicy;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "spire-shellper", about = "spire out-of-process session holder", version)]
struct Args {
    /// Unix-domain socket to serve the daemon on.
    #[arg(long)]
    socket: PathBuf,

    /// Working directory for the child process.
    #[arg(long)]
    cwd: PathBuf,

    #[arg(long, default_value_t = 80)]
    cols: u16,

    #[arg(long, default_value_t = 24)]
    rows: u16,

    /// Respawn the child up to this many times when it exits.
    #[arg(long)]
    max_restarts: Option<u32>,

    #[arg(long, default_value_t = 1000)]
    restart_delay_ms: u64,

    /// Bytes of output retained for replay on reconnect.
    #[arg(long, default_value_t = 256 * 1024)]
    scrollback_bytes: usize,

    /// Optional log file; a holder runs fully detached, so without this
    /// it logs nowhere.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Command and arguments to run on the PTY (after `--`).
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(log_file)?;
        tracing_subscriber::fmt().with_writer(file).with_ansi(false).init();
    }

    let config = holder::HolderConfig {
        socket_path: args.socket,
        cwd: args.cwd,
        cols: args.cols,
        rows: args.rows,
        restart: args
            .max_restarts
            .map(|max_restarts| RestartPolicy { max_restarts, delay_ms: args.restart_delay_ms }),
        scrollback_bytes: args.scrollback_bytes,
        command: args.command,
    };
    holder::run(config).await
}
