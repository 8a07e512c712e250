//! Simulation configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sprox_core::SchedulerConfig;
use sprox_protocol::TransportConfig;
use std::path::Path;

/// Everything a simulation run needs. Loaded from TOML, then overridden from the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SimConfig {
    /// Independent proxy contexts sharing the backing store
    pub contexts: usize,
    /// Consumers writing through each context
    pub consumers: usize,
    /// Operations issued by each consumer
    pub ops: usize,
    /// Distinct collection ids the consumers contend on
    pub items: usize,
    /// Upper bound of the random delay added to each host message
    pub max_delay_ms: u64,
    /// RNG seed; random when absent
    pub seed: Option<u64>,
    /// Capacity of each store's update broadcast
    pub event_capacity: usize,
    /// How long to wait for replicas to settle after the last write
    pub settle_timeout_ms: u64,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            contexts: 3,
            consumers: 2,
            ops: 50,
            items: 8,
            max_delay_ms: 5,
            seed: None,
            event_capacity: 1024,
            settle_timeout_ms: 5_000,
            scheduler: SchedulerConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load a configuration file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}
