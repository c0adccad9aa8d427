//! Datapath Observer CLI
//!
//! Queries the controller's HTTP API for startup latency percentiles and
//! pod health.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use commands::{health, latency};
use observer_lib::LatencyMetric;

/// Datapath Observer CLI
#[derive(Parser)]
#[command(name = "dpo")]
#[command(author, version, about = "CLI for the Datapath Observer", long_about = None)]
pub struct Cli {
    /// Query API URL (can also be set via DPO_API_URL env var)
    #[arg(long, env = "DPO_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Filters shared by every query
#[derive(Args, Debug, Clone, Default)]
pub struct QueryArgs {
    /// Restrict to one namespace
    #[arg(long, short)]
    pub namespace: Option<String>,

    /// Number of detail rows to return (server default: 10)
    #[arg(long)]
    pub top_n: Option<usize>,

    /// Equality label selector, e.g. app=perf-sut,tier=web
    #[arg(long, short = 'l')]
    pub selector: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Latency from pod creation to container start
    TimeToStart(QueryArgs),

    /// Latency from pod creation to datapath readiness
    TimeToDatapathReady(QueryArgs),

    /// Running, pending and failed pod counts
    PodHealth(QueryArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = client::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::TimeToStart(args) => {
            latency::show_latency(&client, LatencyMetric::TimeToStart, &args, cli.format).await?;
        }
        Commands::TimeToDatapathReady(args) => {
            latency::show_latency(&client, LatencyMetric::TimeToDatapathReady, &args, cli.format)
                .await?;
        }
        Commands::PodHealth(args) => {
            health::show_pod_health(&client, &args, cli.format).await?;
        }
    }

    Ok(())
}
