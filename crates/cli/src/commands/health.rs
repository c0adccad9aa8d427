//! Pod health command

use anyhow::Result;
use colored::Colorize;
use observer_lib::{PodDetails, PodHealthResult};
use tabled::{settings::Style, Table, Tabled};

use crate::client::ApiClient;
use crate::output::{color_pct, color_phase, or_dash, print_json, OutputFormat};
use crate::QueryArgs;

/// Row for pods that are not running
#[derive(Tabled)]
struct PodRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Pod")]
    name: String,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Message")]
    message: String,
}

impl From<&PodDetails> for PodRow {
    fn from(pod: &PodDetails) -> Self {
        Self {
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
            node: or_dash(&pod.node_name),
            phase: color_phase(&pod.phase),
            reason: or_dash(&pod.reason),
            message: or_dash(&pod.message),
        }
    }
}

fn render_list(heading: &str, pods: &[PodDetails]) {
    if pods.is_empty() {
        return;
    }
    println!();
    println!("{}", heading.bold());
    let rows: Vec<PodRow> = pods.iter().map(PodRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

/// Render pod health as a summary plus detail tables
pub fn render(result: &PodHealthResult) {
    println!("{}", "Pod Health".bold());
    println!("{}", "=".repeat(50));
    if !result.namespace.is_empty() {
        println!("Namespace:   {}", result.namespace.cyan());
    }
    if !result.label_selector.is_empty() {
        println!("Selector:    {}", result.label_selector.cyan());
    }
    println!("Pods:        {}", result.desired_replicas);
    println!("Running:     {}", result.running_pods.to_string().green());
    println!("Pending:     {}", result.pending_pods.to_string().yellow());
    println!("Failed:      {}", result.failed_pods.to_string().red());
    println!("Success:     {}", color_pct(result.success_pct));

    render_list("Pending Pods", &result.pending_pod_list);
    render_list("Failed Pods", &result.failed_pod_list);
}

/// Show pod health
pub async fn show_pod_health(
    client: &ApiClient,
    args: &QueryArgs,
    format: OutputFormat,
) -> Result<()> {
    let result = client.pod_health(args).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => render(&result),
    }

    Ok(())
}
