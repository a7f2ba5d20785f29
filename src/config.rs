//! Engine configuration
//!
//! JSON configuration for the engine parameters. Every field has a default
//! so a missing file section falls back to the standard simulation setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::engine::{BrokerParameters, ExchangeParameters, RiskParameters};

fn default_live_frequency() -> String {
    "1min".to_string()
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Frequency used for live pricing of intents and PnL
    #[serde(default = "default_live_frequency")]
    pub live_frequency: String,

    #[serde(default)]
    pub risk: RiskParameters,

    #[serde(default)]
    pub exchange: ExchangeParameters,

    #[serde(default)]
    pub broker: BrokerParameters,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            live_frequency: default_live_frequency(),
            risk: RiskParameters::default(),
            exchange: ExchangeParameters::default(),
            broker: BrokerParameters::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: EngineConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        Ok(config)
    }
}
