//! Datapath reporter
//!
//! Runs inside the measured pod. Records when the container started, probes
//! the datapath target until it answers, and writes both timestamps onto the
//! pod as annotations. Exits non-zero when the probe times out or the API
//! server stays unreachable.

use anyhow::Result;
use observer_lib::{
    probe::{Clock, NetworkProber, SystemClock},
    reporter::{ReportOutcome, Reporter},
    store::{InstanceApi, KubeInstanceApi},
    StructuredLogger,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const REPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let start_ts = SystemClock.now();

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = config::ReporterConfig::load()?;
    let settings = config.settings();

    let logger = StructuredLogger::new(settings.pod.to_string());
    logger.log_startup(REPORTER_VERSION);

    let reporter = Reporter::new(
        settings,
        Arc::new(NetworkProber::new()?),
        Arc::new(SystemClock),
    )
    .started_at(start_ts);

    let connect = || async {
        let client = kube::Client::try_default().await?;
        Ok::<Arc<dyn InstanceApi>, kube::Error>(Arc::new(KubeInstanceApi::new(client)))
    };

    match reporter.run(connect).await {
        Ok(ReportOutcome::Skipped) => {
            info!("Annotations already recorded");
            logger.log_shutdown("skipped");
            Ok(())
        }
        Ok(ReportOutcome::Patched { .. }) => {
            logger.log_shutdown("annotations patched");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Reporter failed");
            logger.log_shutdown("failed");
            Err(e.into())
        }
    }
}
