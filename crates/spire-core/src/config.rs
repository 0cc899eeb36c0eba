//! Configuration management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spire_types::shellper::RestartPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon settings, persisted as JSON under the spire home directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    /// HTTP/WebSocket port; the daemon binds 127.0.0.1.
    pub port: u16,
    /// Lines retained per session ring buffer.
    pub ring_capacity: usize,
    /// A target must have seen no input for this long before a queued
    /// message is delivered.
    pub send_idle_threshold_ms: u64,
    /// SendBuffer flush cadence.
    pub send_flush_interval_ms: u64,
    /// Queued messages older than this are delivered regardless of typing.
    pub send_max_age_ms: u64,
    /// Pause between writing the interrupt byte and the message body.
    pub interrupt_delay_ms: u64,
    /// Grace between SIGTERM and SIGKILL on `kill()`.
    pub kill_grace_ms: u64,
    /// How long to wait for a fresh holder's meta frame before declaring
    /// the spawn failed.
    pub holder_meta_timeout_ms: u64,
    /// Restart policy applied to architect holders (fresh and reconnected).
    pub architect_restart: RestartPolicy,
    /// Override path to the spire-shellper binary. Defaults to a sibling
    /// of the running executable, falling back to `$PATH`.
    pub shellper_bin: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 16793,
            ring_capacity: 10_000,
            send_idle_threshold_ms: 3_000,
            send_flush_interval_ms: 500,
            send_max_age_ms: 60_000,
            interrupt_delay_ms: 100,
            kill_grace_ms: 500,
            holder_meta_timeout_ms: 5_000,
            architect_restart: RestartPolicy { max_restarts: 5, delay_ms: 1_000 },
            shellper_bin: None,
        }
    }
}

impl Settings {
    pub fn send_idle_threshold(&self) -> Duration {
        Duration::from_millis(self.send_idle_threshold_ms)
    }

    pub fn send_flush_interval(&self) -> Duration {
        Duration::from_millis(self.send_flush_interval_ms)
    }

    pub fn send_max_age(&self) -> Duration {
        Duration::from_millis(self.send_max_age_ms)
    }

    pub fn interrupt_delay(&self) -> Duration {
        Duration::from_millis(self.interrupt_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn holder_meta_timeout(&self) -> Duration {
        Duration::from_millis(self.holder_meta_timeout_ms)
    }
}

pub struct SettingsManager;

impl SettingsManager {
    /// The spire home directory (~/.spire), overridable with SPIRE_HOME.
    pub fn spire_home() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("SPIRE_HOME") {
            return Ok(PathBuf::from(path));
        }
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".spire"))
    }

    pub fn settings_path() -> Result<PathBuf> {
        Ok(Self::spire_home()?.join("settings.json"))
    }

    /// Directory holding shellper holder sockets.
    pub fn sockets_dir() -> Result<PathBuf> {
        Ok(Self::spire_home()?.join("shellper"))
    }

    /// The durable record store (one SQLite file).
    pub fn db_path() -> Result<PathBuf> {
        Ok(Self::spire_home()?.join("spire.db"))
    }

    pub fn pid_path() -> Result<PathBuf> {
        Ok(Self::spire_home()?.join("spired.pid"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::spire_home()?.join("spired.log"))
    }

    /// Load settings, creating the default file on first run.
    pub fn load() -> Result<Settings> {
        let path = Self::settings_path()?;
        if !path.exists() {
            let settings = Settings::default();
            Self::save(&settings)?;
            return Ok(settings);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings from {:?}", path))
    }

    /// Save settings to disk, owner-readable only.
    pub fn save(settings: &Settings) -> Result<()> {
        let path = Self::settings_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let content =
            serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write settings to {:?}", path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, settings.port);
        assert_eq!(back.ring_capacity, 10_000);
        assert_eq!(back.send_idle_threshold_ms, 3_000);
    }

    #[test]
    fn unknown_and_missing_fields_use_defaults() {
        let partial: Settings = serde_json::from_str(r#"{"port": 9999}"#).unwrap();
        assert_eq!(partial.port, 9999);
        assert_eq!(partial.kill_grace_ms, 500);
    }
}
