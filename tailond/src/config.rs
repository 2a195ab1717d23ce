//! tailond configuration loading and validation

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tailon_supervisor::{ApplicationConfig, ManagerOptions, Role, StopSignal};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tailon/config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct TailonConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SecurityConfig {
    /// Role granted on every application to callers without their own grants.
    #[serde(default = "default_role")]
    pub default_role: Role,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            default_role: default_role(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_restart_timeout_ms")]
    pub restart_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
            restart_timeout_ms: default_restart_timeout_ms(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

fn default_listen() -> String { "127.0.0.1:8080".into() }
fn default_role() -> Role { Role::Admin }
fn default_log_capacity() -> usize { 1000 }
fn default_restart_timeout_ms() -> u64 { 5000 }
fn default_shutdown_timeout_seconds() -> u64 { 10 }

impl Default for TailonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            security: SecurityConfig::default(),
            supervisor: SupervisorConfig::default(),
            applications: Vec::new(),
        }
    }
}

impl TailonConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        if self.listen.trim().is_empty() {
            bail!("listen address must not be empty");
        }
        self.listen
            .trim()
            .parse()
            .with_context(|| format!("Invalid listen address {:?}", self.listen))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.shutdown_timeout_seconds)
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            log_capacity: self.supervisor.log_capacity,
            restart_timeout: Duration::from_millis(self.supervisor.restart_timeout_ms),
            ..ManagerOptions::default()
        }
    }

    /// Reject configurations the supervisor cannot run. Unknown stop signals
    /// only warn, since the supervisor falls back to SIGINT.
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        let mut seen = HashSet::new();
        for app in &self.applications {
            if app.name.trim().is_empty() {
                bail!("application name must not be empty");
            }
            if !seen.insert(app.name.as_str()) {
                bail!("duplicate application name {:?}", app.name);
            }
            if app.path.as_os_str().is_empty() {
                bail!("application {:?} has an empty path", app.name);
            }
            if let Err(e) = StopSignal::resolve(app.stop_signal.as_deref()) {
                warn!(app = %app.name, "{e}, SIGINT will be used");
            }
        }
        Ok(())
    }
}

/// Load and validate the configuration at `path`. A missing file yields the
/// defaults, which supervise nothing.
pub fn load_config(path: &Path) -> Result<TailonConfig> {
    let config = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?
    } else {
        warn!("Config file not found at {}, using defaults", path.display());
        TailonConfig::default()
    };

    config.validate()?;
    Ok(config)
}
