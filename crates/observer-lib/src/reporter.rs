//! In-pod startup latency reporter
//!
//! The reporter records its own start time, probes the datapath until it is
//! reachable, and merge-patches both timestamps onto its pod's annotations:
//!
//! 1. Probing starts before any API client is built, so client setup latency
//!    never leaks into the datapath-ready measurement.
//! 2. If both annotations already exist (e.g. container restart), nothing is
//!    patched.
//! 3. A probe timeout is fatal unless best-effort mode is enabled, so the
//!    hosting orchestrator can retry the whole measurement.
//! 4. Every remote call retries with exponential backoff.

use crate::models::{
    format_timestamp, InstanceKey, DP_READY_TS_ANNOTATION, START_TS_ANNOTATION,
};
use crate::observability::StructuredLogger;
use crate::probe::{probe_until_success, Clock, Prober};
use crate::store::{InstanceApi, StoreError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Initial delay between retries of remote operations
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Attempts made for each remote operation before giving up
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Reporter failures; all of them end the process with a non-zero status
#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },
    #[error("datapath probe did not succeed within {0:?}")]
    ProbeTimeout(Duration),
    #[error("probe task failed: {0}")]
    ProbeTask(String),
}

/// Exponential backoff policy for remote operations
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: INITIAL_RETRY_DELAY,
            max_attempts: MAX_RETRY_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given zero-based failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay * 2u32.saturating_pow(attempt)
    }

    /// Run `op` until it succeeds or the attempts are exhausted
    pub async fn run<T, E, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, ReporterError>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last_error = String::new();
        for attempt in 0..self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < self.max_attempts {
                        let delay = self.delay_for(attempt);
                        warn!(
                            operation,
                            attempt = attempt + 1,
                            max_attempts = self.max_attempts,
                            error = %last_error,
                            retry_in_ms = delay.as_millis() as u64,
                            "Remote operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(ReporterError::RetriesExhausted {
            operation,
            attempts: self.max_attempts,
            last_error,
        })
    }
}

/// Reporter settings
#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub pod: InstanceKey,
    pub probe_target: String,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    /// Patch only the start timestamp when the probe times out, instead of failing
    pub best_effort: bool,
    pub retry: RetryPolicy,
}

/// How a reporter run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Both annotations were already present
    Skipped,
    /// Annotations patched; `None` means the key was not part of the patch
    Patched {
        start_ts: Option<DateTime<Utc>>,
        dp_ready_ts: Option<DateTime<Utc>>,
    },
}

/// Build the merge patch: start-ts only if absent, dp-ready-ts only if measured
pub fn annotation_patch(
    has_start_ts: bool,
    start_ts: DateTime<Utc>,
    dp_ready_ts: Option<DateTime<Utc>>,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    if !has_start_ts {
        annotations.insert(START_TS_ANNOTATION.to_string(), format_timestamp(start_ts));
    }
    if let Some(ts) = dp_ready_ts {
        annotations.insert(DP_READY_TS_ANNOTATION.to_string(), format_timestamp(ts));
    }
    annotations
}

/// The reporter state machine
pub struct Reporter {
    settings: ReporterSettings,
    prober: Arc<dyn Prober>,
    clock: Arc<dyn Clock>,
    started_at: Option<DateTime<Utc>>,
    logger: StructuredLogger,
}

impl Reporter {
    pub fn new(
        settings: ReporterSettings,
        prober: Arc<dyn Prober>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let logger = StructuredLogger::new(settings.pod.to_string());
        Self {
            settings,
            prober,
            clock,
            started_at: None,
            logger,
        }
    }

    /// Use a start time captured at process entry instead of reading the
    /// clock when `run` begins.
    pub fn started_at(mut self, start_ts: DateTime<Utc>) -> Self {
        self.started_at = Some(start_ts);
        self
    }

    /// Run one measurement.
    ///
    /// `connect` builds the API client; it is retried with the same backoff as
    /// every other remote call.
    pub async fn run<C, Fut, E>(self, connect: C) -> Result<ReportOutcome, ReporterError>
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = Result<Arc<dyn InstanceApi>, E>>,
        E: std::fmt::Display,
    {
        let start_ts = self.started_at.unwrap_or_else(|| self.clock.now());
        info!(
            pod = %self.settings.pod,
            start_ts = %format_timestamp(start_ts),
            target = %self.settings.probe_target,
            timeout_secs = self.settings.probe_timeout.as_secs(),
            interval_secs = self.settings.probe_interval.as_secs(),
            "Starting reporter"
        );

        let probe_task = {
            let prober = self.prober.clone();
            let clock = self.clock.clone();
            let target = self.settings.probe_target.clone();
            let timeout = self.settings.probe_timeout;
            let interval = self.settings.probe_interval;
            tokio::spawn(async move {
                probe_until_success(prober.as_ref(), clock.as_ref(), &target, timeout, interval)
                    .await
            })
        };

        let retry = self.settings.retry;
        let api = retry.run("create API client", connect).await?;

        let pod_key = self.settings.pod.clone();
        let instance = retry
            .run("get pod", || {
                let api = api.clone();
                let key = pod_key.clone();
                async move { api.get(&key).await }
            })
            .await?;

        let has_start_ts = instance.annotations.contains_key(START_TS_ANNOTATION);
        if has_start_ts && instance.annotations.contains_key(DP_READY_TS_ANNOTATION) {
            info!(pod = %pod_key, "Annotations already present, skipping patch");
            probe_task.abort();
            return Ok(ReportOutcome::Skipped);
        }

        let dp_ready_ts = probe_task
            .await
            .map_err(|e| ReporterError::ProbeTask(e.to_string()))?;

        match dp_ready_ts {
            Some(ts) => self.logger.log_probe_succeeded(start_ts, ts),
            None if self.settings.best_effort => {
                warn!(
                    pod = %pod_key,
                    timeout_secs = self.settings.probe_timeout.as_secs(),
                    "Datapath probe timed out, patching start timestamp only"
                );
            }
            None => return Err(ReporterError::ProbeTimeout(self.settings.probe_timeout)),
        }

        let patch = annotation_patch(has_start_ts, start_ts, dp_ready_ts);
        if patch.is_empty() {
            info!(pod = %pod_key, "Nothing to patch");
            return Ok(ReportOutcome::Skipped);
        }

        retry
            .run("patch pod annotations", || {
                let api = api.clone();
                let key = pod_key.clone();
                let patch = patch.clone();
                async move { api.patch_annotations(&key, &patch).await }
            })
            .await?;

        self.logger.log_annotations_patched(&patch);

        Ok(ReportOutcome::Patched {
            start_ts: (!has_start_ts).then_some(start_ts),
            dp_ready_ts,
        })
    }
}

/// Connector that always hands out the same client
pub fn fixed_client(
    api: Arc<dyn InstanceApi>,
) -> impl FnMut() -> std::future::Ready<Result<Arc<dyn InstanceApi>, StoreError>> {
    move || std::future::ready(Ok(api.clone()))
}
