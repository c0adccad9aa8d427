//! CLI subcommand implementations

pub mod health;
pub mod latency;
