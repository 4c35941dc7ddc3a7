// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use meshbus_core::domain::mesh_config::MeshConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the full manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file populated with defaults
    Generate {
        /// Output path (default: ./meshbus-config.yaml)
        #[arg(short, long, default_value = "./meshbus-config.yaml")]
        output: PathBuf,

        /// Broker domain to write into the generated file
        #[arg(long)]
        domain: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, domain, force } => generate(output, domain, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = MeshConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. MESHBUS_CONFIG_PATH: {}",
            std::env::var("MESHBUS_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./meshbus-config.yaml");
        println!("  4. ~/.meshbus/config.yaml");
        println!("  5. /etc/meshbus/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  Domain: {}", spec.node.domain);
    println!("  Channel prefix: {}", spec.node.channel_prefix);
    println!("  Gateway: {}", spec.node.gateway);
    println!("  Transport: {:?}", spec.transport.backend);
    if let Some(broker) = &spec.transport.broker {
        println!("  Broker: {}", broker);
    }
    println!("  Channel capacity: {}", spec.transport.channel_capacity);
    println!();

    println!("{}", "Registry:".bold());
    println!("  Liveness window: {:?}", spec.registry.liveness_window);
    println!("  Trust learning rate: {}", spec.registry.learning_rate);
    println!("  Trust decay per hour: {}", spec.registry.decay_per_hour);
    println!();

    println!("{}", "Delivery:".bold());
    println!("  Max retries: {}", spec.store_forward.max_retries);
    println!(
        "  Backoff: base {:?}, factor {}, cap {:?}",
        spec.store_forward.backoff.base, spec.store_forward.backoff.factor, spec.store_forward.backoff.cap
    );
    println!("  Ack timeout: {:?}", spec.store_forward.ack_timeout);
    println!("  Max in flight: {}", spec.store_forward.max_in_flight);
    println!(
        "  State: {}",
        spec.store_forward.state_path.as_deref().unwrap_or("(in memory)")
    );
    println!(
        "  Circuit breaker: {} failures, recovery after {:?}",
        spec.circuit_breaker.failure_threshold, spec.circuit_breaker.recovery_timeout
    );
    println!();

    println!("{}", "Maintenance:".bold());
    println!("  Help timeout: {} min", spec.help.default_timeout_minutes);
    println!("  Sweep interval: {:?}", spec.sweeper.interval);
    println!(
        "  Dead letters: batch {}, replay limit {}",
        spec.dead_letter.batch_size, spec.dead_letter.replay_limit
    );
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = MeshConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, domain: Option<String>, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let mut config = MeshConfigManifest::default();
    if let Some(domain) = domain {
        config.spec.node.domain = domain;
    }
    config.validate().context("Generated configuration is invalid")?;
    config
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
