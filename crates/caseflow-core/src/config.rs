//! Caseflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CaseflowError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CaseflowConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

impl CaseflowConfig {
    /// Load config from the default path (~/.caseflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CaseflowError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CaseflowError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CaseflowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Caseflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".caseflow")
    }
}

/// Gateway (HTTP/WebSocket) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    3200
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Main database path (definitions, agents, run records).
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.caseflow/caseflow.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Schedule engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Job store path. Separate file so the engine's persisted jobs
    /// survive independently of the main database.
    #[serde(default = "default_jobs_db_path")]
    pub db_path: String,
    /// Tick granularity of the engine loop.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// A due job older than this is skipped, not run late.
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
}

fn default_jobs_db_path() -> String {
    "~/.caseflow/jobs.db".into()
}
fn default_tick_secs() -> u64 {
    1
}
fn default_misfire_grace_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            db_path: default_jobs_db_path(),
            tick_secs: default_tick_secs(),
            misfire_grace_secs: default_misfire_grace_secs(),
        }
    }
}

/// Agent liveness monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Sweep interval over all registered agents.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Health probe timeout per agent.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// A cache marker younger than this counts as alive.
    #[serde(default = "default_marker_ttl_secs")]
    pub marker_ttl_secs: u64,
    /// Port the agent's /health endpoint listens on.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
}

fn default_check_interval_secs() -> u64 {
    60
}
fn default_probe_timeout_secs() -> u64 {
    2
}
fn default_marker_ttl_secs() -> u64 {
    30
}
fn default_agent_port() -> u16 {
    9001
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            marker_ttl_secs: default_marker_ttl_secs(),
            agent_port: default_agent_port(),
        }
    }
}

/// Live relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Buffered frames retained per topic for replay on (re)connect.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    500
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

/// Message channel (publish) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Publish attempts before giving up.
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    /// Fixed delay between attempts.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_publish_attempts() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    5
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            publish_attempts: default_publish_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CaseflowConfig::default();
        assert_eq!(config.gateway.port, 3200);
        assert_eq!(config.heartbeat.check_interval_secs, 60);
        assert_eq!(config.heartbeat.marker_ttl_secs, 30);
        assert_eq!(config.scheduler.misfire_grace_secs, 30);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [gateway]
            port = 8080

            [heartbeat]
            check_interval_secs = 15
        "#;
        let config: CaseflowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.heartbeat.check_interval_secs, 15);
        // untouched sections keep defaults
        assert_eq!(config.channel.publish_attempts, 3);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: CaseflowConfig = toml::from_str("").unwrap();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.relay.history_limit, 500);
    }

    #[test]
    fn test_home_dir() {
        let home = CaseflowConfig::home_dir();
        assert!(home.to_string_lossy().contains("caseflow"));
    }
}
