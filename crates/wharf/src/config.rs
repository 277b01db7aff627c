//! Service configuration.
//!
//! Loaded from defaults, an optional TOML file and `WHARF__*` environment
//! variables (double underscore separates sections, e.g.
//! `WHARF__TERMINAL__DEFAULT_SESSION_LIMIT=4`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::permissions::Role;
use crate::runtime::RuntimeType;

pub const APP_NAME: &str = "wharf";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WharfConfig {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub runtime: RuntimeSettings,
    pub ports: PortSettings,
    pub terminal: TerminalSettings,
    pub permissions: PermissionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON log lines instead of the human format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to `<data dir>/wharf/wharf.db`.
    pub path: Option<String>,
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    pub runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    pub binary: Option<String>,
    /// Upper bound for a single daemon call, in seconds.
    pub call_timeout_secs: u64,
    /// Attempts for calls that fail because the daemon is unreachable.
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Grace period handed to `stop` before the daemon kills the container.
    pub stop_timeout_secs: u32,
    /// Command run inside the container for terminal sessions.
    pub shell: Vec<String>,
    pub term: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            call_timeout_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
            stop_timeout_secs: 10,
            shell: vec!["/bin/sh".to_string()],
            term: "xterm-256color".to_string(),
        }
    }
}

/// Host port forwarding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// Address the host-side listeners bind to.
    pub bind_address: String,
    pub range_start: u16,
    pub range_end: u16,
    /// Timeout for connecting to the container side of a forward.
    pub connect_timeout_secs: u64,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            range_start: 42000,
            range_end: 42999,
            connect_timeout_secs: 5,
        }
    }
}

/// Terminal session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSettings {
    /// Concurrent sessions per user; -1 means unlimited.
    pub default_session_limit: i64,
    /// Per-user overrides of `default_session_limit`.
    pub user_limits: HashMap<String, i64>,
    /// Idle sessions are closed after this many seconds (0 disables).
    pub idle_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            default_session_limit: 4,
            user_limits: HashMap::new(),
            idle_timeout_secs: 30 * 60,
            idle_check_interval_secs: 60,
            rows: 40,
            cols: 120,
        }
    }
}

/// Static role table consulted by the built-in permission gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSettings {
    pub default_role: Option<Role>,
    pub users: HashMap<String, Role>,
}

impl WharfConfig {
    /// Check values the type system cannot.
    pub fn validate(&self) -> Result<()> {
        if self.ports.range_start == 0 || self.ports.range_start > self.ports.range_end {
            anyhow::bail!(
                "invalid port range {}-{}",
                self.ports.range_start,
                self.ports.range_end
            );
        }
        if self.terminal.default_session_limit < -1 {
            anyhow::bail!("terminal.default_session_limit must be -1 or greater");
        }
        if let Some((user, limit)) = self.terminal.user_limits.iter().find(|(_, l)| **l < -1) {
            anyhow::bail!("terminal limit for {user} must be -1 or greater (got {limit})");
        }
        if self.runtime.shell.is_empty() {
            anyhow::bail!("runtime.shell cannot be empty");
        }
        self.ports
            .bind_address
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("invalid ports.bind_address {}", self.ports.bind_address))?;
        Ok(())
    }

    /// Resolve the database path, expanding `~` and environment variables.
    pub fn database_path(&self) -> Result<PathBuf> {
        match self.database.path {
            Some(ref path) => expand_str_path(path),
            None => Ok(default_data_dir()?.join("wharf.db")),
        }
    }
}

/// Default config file location (`$XDG_CONFIG_HOME/wharf/config.toml`).
pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("cannot determine config directory")?;
    Ok(dir.join(APP_NAME).join("config.toml"))
}

fn default_data_dir() -> Result<PathBuf> {
    let dir = dirs::data_dir().context("cannot determine data directory")?;
    Ok(dir.join(APP_NAME))
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded =
        shellexpand::full(text).with_context(|| format!("expanding path {text}"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Load configuration from `path` (if it exists) and the environment.
pub fn load(path: &Path) -> Result<WharfConfig> {
    let built = Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix("WHARF")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("reading config {}", path.display()))?;

    let config: WharfConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;
    config.validate()?;
    Ok(config)
}

/// Write the default configuration to `path` unless it already exists.
pub fn write_default(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(&WharfConfig::default())
        .context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        WharfConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let mut config = WharfConfig::default();
        config.terminal.default_session_limit = -2;
        assert!(config.validate().is_err());

        let mut config = WharfConfig::default();
        config.terminal.user_limits.insert("bob".into(), -5);
        assert!(config.validate().is_err());

        let mut config = WharfConfig::default();
        config.ports.range_start = 5000;
        config.ports.range_end = 4000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[terminal]
default_session_limit = 1
idle_timeout_secs = 5

[terminal.user_limits]
admin = -1

[ports]
range_start = 43000
range_end = 43010

[permissions.users]
alice = "admin"
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.terminal.default_session_limit, 1);
        assert_eq!(config.terminal.user_limits.get("admin"), Some(&-1));
        assert_eq!(config.ports.range_start, 43000);
        assert_eq!(config.permissions.users.get("alice"), Some(&Role::Admin));
        // Untouched sections keep their defaults.
        assert_eq!(config.runtime.retry_attempts, 3);
    }

    #[test]
    fn test_write_default_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default(&path).unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.ports.range_end, PortSettings::default().range_end);
    }
}
