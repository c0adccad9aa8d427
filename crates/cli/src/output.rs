//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print any response as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format milliseconds as a human-readable duration
pub fn format_ms(ms: i64) -> String {
    if ms.abs() >= 60_000 {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000).abs() / 1000)
    } else if ms.abs() >= 1000 {
        format!("{:.2}s", ms as f64 / 1000.0)
    } else {
        format!("{}ms", ms)
    }
}

/// Color a pod phase
pub fn color_phase(phase: &str) -> String {
    match phase.to_lowercase().as_str() {
        "running" | "succeeded" => phase.green().to_string(),
        "pending" => phase.yellow().to_string(),
        "failed" => phase.red().to_string(),
        _ => phase.to_string(),
    }
}

/// Color a success percentage
pub fn color_pct(pct: f64) -> String {
    let formatted = format!("{:.1}%", pct);
    if pct >= 99.0 {
        formatted.green().to_string()
    } else if pct >= 90.0 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

/// Placeholder for empty optional cells
pub fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}
