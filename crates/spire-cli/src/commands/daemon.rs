//! Daemon lifecycle management: start/stop/status via the pid file.

use anyhow::{Context, Result};
use colored::Colorize;
use spire_core::config::SettingsManager;
use std::process::Stdio;
use tokio::process::Command;

fn read_pid() -> Option<u32> {
    let pid_path = SettingsManager::pid_path().ok()?;
    let pid_str = std::fs::read_to_string(pid_path).ok()?;
    pid_str.trim().parse().ok()
}

fn is_running() -> Option<u32> {
    read_pid().filter(|&pid| spire_core::paths::pid_alive(pid))
}

fn daemon_bin() -> std::path::PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("spired");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    std::path::PathBuf::from("spired")
}

pub async fn start() -> Result<()> {
    if let Some(pid) = is_running() {
        println!("{} daemon already running (pid {})", "✓".green(), pid);
        return Ok(());
    }

    let home = SettingsManager::spire_home()?;
    tokio::fs::create_dir_all(&home).await?;
    let log_path = SettingsManager::log_path()?;

    let mut cmd = Command::new(daemon_bin());
    cmd.arg("--log-file")
        .arg(&log_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .current_dir(&home);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.spawn().context("failed to spawn spired")?;

    // give it a moment to bind and write its pid file
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Some(pid) = is_running() {
            println!("{} daemon started (pid {}, log {})", "✓".green(), pid, log_path.display());
            return Ok(());
        }
    }
    anyhow::bail!("daemon did not come up; check {}", log_path.display())
}

pub async fn stop() -> Result<()> {
    match is_running() {
        Some(pid) => {
            spire_core::paths::send_sigterm(pid);
            println!("{} sent SIGTERM to daemon (pid {})", "✓".green(), pid);
            println!("  holder-backed sessions keep running and reconnect on next start");
            Ok(())
        }
        None => {
            println!("daemon is not running");
            Ok(())
        }
    }
}

pub async fn status() -> Result<()> {
    match is_running() {
        Some(pid) => {
            println!("{} daemon running (pid {})", "✓".green(), pid);
            if let Ok(client) = crate::api::ApiClient::new() {
                if let Ok(health) =
                    client.get::<spire_types::api::HealthResponse>("/health").await
                {
                    println!(
                        "  v{}, up {}s, {} terminal(s), {} workspace(s)",
                        health.version, health.uptime_secs, health.terminals, health.workspaces
                    );
                }
            }
        }
        None => println!("{} daemon is not running", "✗".red()),
    }
    Ok(())
}
