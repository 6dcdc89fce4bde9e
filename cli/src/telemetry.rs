// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Logging and metrics setup.

use anyhow::{Context, Result};
use clap::ValueEnum;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Parse the `observability.logging.format` config value.
    pub fn from_config(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Initialize the tracing subscriber. Logs go to stderr so command output on
/// stdout stays machine readable. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

/// Start the Prometheus exporter on `port` and describe the core metrics.
pub fn init_metrics(port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to start Prometheus exporter")?;

    describe_counter!("lvblob_attach_total", "Attach calls that committed a new holder");
    describe_counter!("lvblob_detach_total", "Detach calls that removed a holder");
    describe_counter!("lvblob_pool_migrations_total", "Pools moved between nodes");
    describe_counter!("lvblob_cas_conflicts_total", "Lost compare-and-swap races on pool records");
    describe_histogram!("lvblob_command_duration_seconds", "Wall time of host commands");

    tracing::info!(port, "Prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_config() {
        assert_eq!(LogFormat::from_config("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_config("TEXT"), Some(LogFormat::Text));
        assert_eq!(LogFormat::from_config("xml"), None);
    }
}
