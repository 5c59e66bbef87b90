//! Orchestrator configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Settings recognized by the orchestrator. Loaded from a TOML file;
/// a missing file falls back to the defaults without failing startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Address the three listeners bind to
    pub bind_addr: String,

    /// Agent channel port
    pub agent_port: u16,

    /// Client channel port
    pub client_port: u16,

    /// Service channel port
    pub service_port: u16,

    /// Default log level when RUST_LOG is unset
    pub log_level: String,

    /// Timeout for orchestrator-initiated waits (delegation, nested sends)
    pub task_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            agent_port: 3000,
            client_port: 3001,
            service_port: 3002,
            log_level: "info".into(),
            task_timeout_ms: 30_000,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn agent_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.bind_addr, self.agent_port).parse()?)
    }

    pub fn client_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.bind_addr, self.client_port).parse()?)
    }

    pub fn service_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.bind_addr, self.service_port).parse()?)
    }
}
