//! Latency percentile commands

use anyhow::Result;
use colored::Colorize;
use observer_lib::{AggregatedResult, LatencyMetric};
use tabled::{settings::Style, Table, Tabled};

use crate::client::ApiClient;
use crate::output::{format_ms, or_dash, print_info, print_json, print_warning, OutputFormat};
use crate::QueryArgs;

/// Row for the slowest pods table
#[derive(Tabled)]
struct WorstPodRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Pod")]
    name: String,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Latency")]
    latency: String,
    #[tabled(rename = "Measured At")]
    measured_at: String,
}

/// Row for the pods without a measurement
#[derive(Tabled)]
struct FailedPodRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Pod")]
    name: String,
    #[tabled(rename = "UID")]
    uid: String,
    #[tabled(rename = "Node")]
    node: String,
}

fn title(metric: LatencyMetric) -> &'static str {
    match metric {
        LatencyMetric::TimeToStart => "Time to Start",
        LatencyMetric::TimeToDatapathReady => "Time to Datapath Ready",
    }
}

/// Render an aggregate as tables
pub fn render(metric: LatencyMetric, result: &AggregatedResult) {
    println!("{}", title(metric).bold());
    println!("{}", "=".repeat(50));
    println!(
        "Pods:        {} measured, {} without measurement",
        result.total_successful.to_string().green(),
        result.total_failed.to_string().red()
    );
    println!();

    if result.count == 0 {
        print_warning("No successful measurements");
    } else {
        println!("{}", "Percentiles".bold());
        println!("{}", "-".repeat(50));
        println!("p50:         {}", format_ms(result.p50));
        println!("p90:         {}", format_ms(result.p90).yellow());
        println!("p99:         {}", format_ms(result.p99).red());
        println!();

        let rows: Vec<WorstPodRow> = result
            .worst_pods
            .iter()
            .map(|p| WorstPodRow {
                namespace: p.namespace.clone(),
                name: p.name.clone(),
                node: or_dash(&p.node_name),
                latency: format_ms(p.value),
                measured_at: or_dash(&p.measured_ts),
            })
            .collect();
        println!("{}", "Slowest Pods".bold());
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    if !result.failed_pods.is_empty() {
        println!();
        let rows: Vec<FailedPodRow> = result
            .failed_pods
            .iter()
            .map(|p| FailedPodRow {
                namespace: p.namespace.clone(),
                name: p.name.clone(),
                uid: p.uid.clone(),
                node: or_dash(&p.node_name),
            })
            .collect();
        println!("{}", "Pods Without Measurement".bold());
        println!("{}", Table::new(rows).with(Style::rounded()));
        if result.total_failed > result.failed_pods.len() {
            print_info(&format!(
                "Showing {} of {}; raise --top-n to see more",
                result.failed_pods.len(),
                result.total_failed
            ));
        }
    }
}

/// Show latency percentiles for one metric
pub async fn show_latency(
    client: &ApiClient,
    metric: LatencyMetric,
    args: &QueryArgs,
    format: OutputFormat,
) -> Result<()> {
    let result = client.latency(metric, args).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => render(metric, &result),
    }

    Ok(())
}
