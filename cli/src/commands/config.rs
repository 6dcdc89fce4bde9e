// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use lvblob_core::domain::node_config::NodeConfigManifest;
use lvblob_core::domain::repository::StorageBackend;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./lvblob-config.yaml)
        #[arg(short, long, default_value = "./lvblob-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, examples } => generate(output, examples),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. LVBLOB_CONFIG_PATH: {}",
            std::env::var("LVBLOB_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./lvblob-config.yaml");
        println!("  4. ~/.lvblob/config.yaml");
        println!("  5. /etc/lvblob/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node Identity:".bold());
    println!("  ID: {}", spec.node.id);
    if let Some(address) = &spec.node.address {
        println!("  Address: {}", address);
    }
    println!();

    println!("{}", "Cluster:".bold());
    if spec.cluster.nodes.is_empty() {
        println!("  {}", "(single node)".dimmed());
    }
    for node in &spec.cluster.nodes {
        println!("  {} → {}", node.id, node.address);
    }
    println!();

    println!("{}", "State Store:".bold());
    match &spec.storage.backend {
        StorageBackend::InMemory => println!("  Backend: in-memory ({})", "state is lost on exit".yellow()),
        StorageBackend::Postgres(pg) => {
            println!("  Backend: postgres");
            println!("  Max connections: {}", pg.max_connections);
        }
    }
    println!();

    println!("{}", "Host Commands:".bold());
    println!("  Timeout: {}s", spec.commands.timeout_seconds);
    println!("  Host namespace: {}", spec.commands.host_namespace);
    if let Some(user) = &spec.commands.ssh_user {
        println!("  SSH user: {}", user);
    }
    println!();

    println!("{}", "Relay:".bold());
    println!("  NBD port: {}", spec.relay.port);
    println!("  QMP socket: {}", spec.relay.qmp_socket);
    println!();

    println!("{}", "Attachment:".bold());
    println!("  CAS attempts: {}", spec.attachment.cas_max_attempts);
    println!(
        "  Backoff: {}ms → {}ms",
        spec.attachment.backoff_initial_ms, spec.attachment.backoff_max_ms
    );
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = template(with_examples);

    std::fs::write(&output, sample).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}

pub fn template(with_examples: bool) -> &'static str {
    if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_are_valid_manifests() {
        for with_examples in [false, true] {
            let manifest = NodeConfigManifest::from_yaml_str(template(with_examples)).unwrap();
            manifest.validate().unwrap();
        }
    }

    #[test]
    fn test_generate_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lvblob-config.yaml");
        generate(path.clone(), false).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, template(false));
    }
}
