//! Engine configuration
//!
//! Settings that shape the settle loop and what happens to store slots
//! when a definition loses its last subscriber.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;

/// Default values for engine settings
pub mod defaults {
    /// Upper bound on resolution passes per command before giving up
    pub const MAX_SETTLE_PASSES: usize = 64;
    /// Prefix for generated engine ids
    pub const ENGINE_ID_PREFIX: &str = "engine";
    /// File name used by `EngineConfig::load` inside a directory
    pub const CONFIG_FILE: &str = "engine.json";
}

/// What to do with a store slot once its definition is deactivated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep the slot so a later reactivation can be satisfied without fetching.
    /// Slots are dropped only through an explicit eviction.
    #[default]
    Retain,
    /// Remove the slot as soon as the definition becomes inactive
    Purge,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Identifier used in logs and events (generated when absent)
    #[serde(default)]
    pub engine_id: Option<String>,
    /// Maximum resolution passes per command
    #[serde(default = "default_max_settle_passes")]
    pub max_settle_passes: usize,
    /// Store retention for deactivated definitions
    #[serde(default)]
    pub retention: RetentionPolicy,
}

fn default_max_settle_passes() -> usize {
    defaults::MAX_SETTLE_PASSES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: None,
            max_settle_passes: defaults::MAX_SETTLE_PASSES,
            retention: RetentionPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from `<dir>/engine.json`
    ///
    /// A missing file yields the default configuration.
    pub async fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(defaults::CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path).await?;
        Self::from_json_str(&contents)
    }

    /// Save configuration to `<dir>/engine.json`
    pub async fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).await?;

        let config_path = dir.join(defaults::CONFIG_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, contents).await?;

        log::info!("Engine configuration saved to {:?}", config_path);
        Ok(())
    }

    /// Set the engine id
    pub fn with_engine_id(mut self, engine_id: impl Into<String>) -> Self {
        self.engine_id = Some(engine_id.into());
        self
    }

    /// Set the retention policy
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Resolve the engine id, generating one when not configured
    pub fn resolve_engine_id(&self) -> String {
        self.engine_id.clone().unwrap_or_else(|| {
            format!("{}-{}", defaults::ENGINE_ID_PREFIX, uuid::Uuid::new_v4())
        })
    }
}
