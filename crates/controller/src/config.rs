//! Controller configuration

use anyhow::{Context, Result};
use observer_lib::controller::{ControllerConfig, TimestampPolicy};
use observer_lib::LabelSelector;
use serde::Deserialize;

/// Controller configuration, read from `OBSERVER_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ObserverConfig {
    /// Namespace to watch; empty watches every namespace
    #[serde(default)]
    pub namespace: String,

    /// Equality label selector, e.g. `app=perf-sut,tier=web`
    #[serde(default)]
    pub label_selector: String,

    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Port of the query, health and metrics server
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub timestamp_policy: TimestampPolicy,
}

fn default_max_concurrent_reconciles() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_api_port() -> u16 {
    8080
}

impl ObserverConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("OBSERVER"))
            .build()?;
        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        config
            .try_deserialize()
            .context("invalid OBSERVER_* configuration")
    }

    pub fn namespace(&self) -> Option<String> {
        Some(self.namespace.trim().to_string()).filter(|ns| !ns.is_empty())
    }

    pub fn labels(&self) -> LabelSelector {
        LabelSelector::parse(&self.label_selector)
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            queue_capacity: self.queue_capacity,
            ..Default::default()
        }
    }
}
