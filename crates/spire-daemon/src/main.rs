//! spired: the spire tower daemon.
//!
//! Supervises interactive sessions across workspaces, serves the HTTP +
//! WebSocket API on loopback, and reconciles holder-backed sessions from
//! the durable store before accepting traffic.

use anyhow::{Context, Result};
use spire_daemon::{app, http};
use clap::Parser;
use spire_core::config::SettingsManager;
use spire_core::dispatch::{spawn_flush_loop, DispatchConfig, Dispatcher, MessageBus, SendBuffer};
use spire_core::reconcile::reconcile;
use spire_core::registry::TerminalRegistry;
use spire_core::session::SessionMap;
use spire_core::shellper::ShellperManager;
use spire_core::store::SessionStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "spired", about = "spire tower daemon", version)]
struct Args {
    /// HTTP/WebSocket port; overrides the settings file.
    #[arg(long)]
    port: Option<u16>,

    /// Append logs to this file (the daemon usually runs detached).
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = if args.verbose {
        "spired=debug,spire_core=debug,tower_http=debug"
    } else {
        "spired=info,spire_core=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    if let Some(log_file) = &args.log_file {
        let dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = log_file.file_name().context("log file needs a file name")?;
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(writer).with_ansi(false).init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        Ok(None)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log_guard = match init_tracing(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {:#}", e);
            std::process::exit(1);
        }
    };

    std::panic::set_hook(Box::new(|info| {
        let location = info.location().map(|l| format!("{}:{}", l.file(), l.line()));
        error!("PANIC at {:?}: {}", location, info);
        eprintln!("[PANIC] at {:?}: {}", location, info);
    }));

    if let Err(e) = run(args).await {
        error!("daemon failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let settings = Arc::new(SettingsManager::load().context("failed to load settings")?);
    let port = args.port.unwrap_or(settings.port);
    info!("starting spired v{} (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());

    let store = Arc::new(
        SessionStore::open(&SettingsManager::db_path()?)
            .await
            .context("failed to open session store")?,
    );
    let registry = Arc::new(TerminalRegistry::new(store.clone()));
    let manager = Arc::new(
        ShellperManager::new(
            SettingsManager::sockets_dir()?,
            settings.shellper_bin.clone(),
            settings.holder_meta_timeout(),
        )
        .context("failed to initialize shellper manager")?,
    );
    let sessions: SessionMap = Arc::new(dashmap::DashMap::new());
    let bus = Arc::new(MessageBus::new());
    let send_buffer = Arc::new(SendBuffer::new());
    let dispatch_cfg = DispatchConfig::from(settings.as_ref());
    let dispatcher = Arc::new(Dispatcher::new(
        sessions.clone(),
        registry.clone(),
        bus.clone(),
        send_buffer.clone(),
        dispatch_cfg,
    ));
    let _flush_task = spawn_flush_loop(send_buffer.clone(), sessions.clone(), dispatch_cfg);

    // Reconciliation runs to completion before the listener opens, so no
    // instance-level request can observe half-rebuilt state.
    let report = reconcile(&store, &registry, &manager, &sessions, &settings)
        .await
        .context("reconciliation failed")?;
    info!(
        "reconciliation: {} reconnected, {} killed, {} stale cleaned",
        report.reconnected, report.killed, report.stale_cleaned
    );

    let web_key = std::env::var("WEB_KEY").ok().filter(|k| !k.is_empty()).map(Arc::new);
    if web_key.is_some() {
        info!("WEB_KEY set: all requests require the bearer token");
    }

    let state = app::AppState {
        settings: settings.clone(),
        store,
        registry,
        manager: manager.clone(),
        sessions,
        dispatcher,
        bus,
        send_buffer,
        started_at: Instant::now(),
        web_key,
        activate_limiter: Arc::new(app::RateLimiter::new(10, Duration::from_secs(60))),
    };

    let pid_path = SettingsManager::pid_path()?;
    tokio::fs::write(&pid_path, std::process::id().to_string())
        .await
        .context("failed to write pid file")?;

    let router = http::build_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener =
        tokio::net::TcpListener::bind(addr).await.with_context(|| format!("failed to bind {}", addr))?;
    info!("spired listening on http://{}", addr);

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Holders stay up across daemon restarts; the durable records let the
    // next daemon reconcile back to them.
    manager.shutdown();
    let _ = tokio::fs::remove_file(&pid_path).await;
    info!("spired stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = sigterm => info!("received SIGTERM"),
    }
}
