//! Reporter configuration
//!
//! The pod identity comes from the downward API (`MY_POD_NAME`,
//! `MY_POD_NAMESPACE`); the probe target and timings are set on the container.

use anyhow::{bail, Context, Result};
use observer_lib::reporter::{ReporterSettings, RetryPolicy};
use observer_lib::InstanceKey;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 2;

/// Environment as read, before validation
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    my_pod_name: Option<String>,
    my_pod_namespace: Option<String>,
    probe_target: Option<String>,
    probe_timeout: Option<String>,
    probe_interval: Option<String>,
    probe_best_effort: Option<String>,
}

/// Validated reporter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReporterConfig {
    pub pod_name: String,
    pub pod_namespace: String,
    pub probe_target: String,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub best_effort: bool,
}

fn required(value: Option<String>, var: &str) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => bail!("{} must be set", var),
    }
}

/// Positive whole seconds, falling back to `default` with a warning
fn seconds(value: Option<String>, var: &str, default: u64) -> Duration {
    let Some(raw) = value else {
        return Duration::from_secs(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => {
            warn!(var, value = %raw, default, "Invalid duration, using default");
            Duration::from_secs(default)
        }
    }
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

impl ReporterConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        let raw: RawConfig = config
            .try_deserialize()
            .context("failed to read reporter environment")?;

        Ok(Self {
            pod_name: required(raw.my_pod_name, "MY_POD_NAME")?,
            pod_namespace: required(raw.my_pod_namespace, "MY_POD_NAMESPACE")?,
            probe_target: required(raw.probe_target, "PROBE_TARGET")?,
            probe_timeout: seconds(raw.probe_timeout, "PROBE_TIMEOUT", DEFAULT_PROBE_TIMEOUT_SECS),
            probe_interval: seconds(
                raw.probe_interval,
                "PROBE_INTERVAL",
                DEFAULT_PROBE_INTERVAL_SECS,
            ),
            best_effort: flag(raw.probe_best_effort),
        })
    }

    pub fn settings(&self) -> ReporterSettings {
        ReporterSettings {
            pod: InstanceKey::new(&self.pod_namespace, &self.pod_name),
            probe_target: self.probe_target.clone(),
            probe_timeout: self.probe_timeout,
            probe_interval: self.probe_interval,
            best_effort: self.best_effort,
            retry: RetryPolicy::default(),
        }
    }
}
