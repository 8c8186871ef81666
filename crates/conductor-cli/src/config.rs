//! `conductor.toml` loading.
//!
//! Every section is optional; a missing file yields the defaults so a local
//! instance can start with nothing but a NATS server.

use conductor_bus::NatsConfig;
use conductor_orchestrator::OrchestratorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub nats: NatsConfig,
    pub store: StoreConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/conductor.db"),
        }
    }
}

impl ConductorConfig {
    /// Read and parse `path`. A file that does not exist is not an error.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::parse(&raw)
                .map_err(|e| anyhow::anyhow!("Invalid config file '{}': {e}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file '{}': {e}",
                path.display()
            )),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}
