// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Positioning bridge CLI
//!
//! # Usage
//!
//! ```bash
//! # Static configuration file
//! posbridge --config posbridge.toml
//!
//! # Configuration source with live transform updates
//! posbridge --source file:///etc/posbridge
//! posbridge --source mqtt://control.local:1883/site-a
//!
//! # Tooling
//! posbridge gen-config --output posbridge.toml
//! posbridge validate --config posbridge.toml
//! posbridge transform --config posbridge.toml 4396 17537 1200
//! ```
//!
//! Exit status: 0 after a requested stop, 1 when startup fails, 2 when a
//! broker connection is lost for good.

use clap::{Parser, Subcommand};
use posbridge::channel::ConfigChannel;
use posbridge::cli::{init_logging, shutdown_signal};
use posbridge::source::{ConfigSource, SourceSpec};
use posbridge::{AnySource, Bridge, BridgeConfig, Shutdown, TransformEngine};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Positioning bridge
#[derive(Parser, Debug)]
#[command(name = "posbridge")]
#[command(about = "Positioning bridge - MQTT position reports re-projected into a floorplan frame")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML, or JSON by extension)
    #[arg(short, long, conflicts_with = "source")]
    config: Option<PathBuf>,

    /// Configuration source (file:///dir or mqtt://host[:port]/prefix)
    #[arg(short, long)]
    source: Option<String>,

    /// Log level (trace, debug, info, warn, error), overrides [logging]
    #[arg(long)]
    log_level: Option<String>,

    /// Append logs to this file, overrides [logging]
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Seconds to wait for the configuration source at startup
    #[arg(long, default_value = "10")]
    fetch_timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "posbridge.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Convert one point with a configuration's transform
    Transform {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Convert from the output frame back to the source frame
        #[arg(long)]
        inverse: bool,

        x: f64,
        y: f64,
        z: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = Args::parse();

    if let Some(cmd) = args.command.take() {
        let level = args.log_level.as_deref().unwrap_or("info");
        if let Err(e) = init_logging(level, args.log_file.as_deref()) {
            eprintln!("Cannot open log file: {}", e);
            return ExitCode::from(1);
        }
        let result = match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
            Commands::Transform {
                config,
                inverse,
                x,
                y,
                z,
            } => cmd_transform(config, inverse, x, y, z),
        };
        return match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::from(1)
            }
        };
    }

    if let Some(path) = args.config.clone() {
        let config = match BridgeConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Configuration invalid ({}): {}", path.display(), e);
                return ExitCode::from(1);
            }
        };
        if let Err(code) = setup_logging(&args, Some(&config)) {
            return code;
        }
        return run_bridge(config, None).await;
    }

    let Some(uri) = args.source.clone() else {
        eprintln!("Missing --config or --source (see --help)");
        return ExitCode::from(1);
    };

    // The configuration is not known yet: log with CLI settings only.
    if let Err(code) = setup_logging(&args, None) {
        return code;
    }

    let spec = match SourceSpec::parse(&uri) {
        Ok(spec) => spec,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(1);
        }
    };
    let source = match spec.open("posbridge").await {
        Ok(source) => Arc::new(source),
        Err(e) => {
            tracing::error!(source = %uri, "Cannot open configuration source: {}", e);
            return ExitCode::from(1);
        }
    };

    let channel = Arc::new(
        ConfigChannel::new(source.clone()).with_fetch_timeout(Duration::from_secs(args.fetch_timeout)),
    );
    let config = match channel.fetch_initial().await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(source = %uri, "Startup configuration unavailable: {}", e);
            source.close().await;
            return ExitCode::from(1);
        }
    };

    let code = run_bridge(config, Some(channel)).await;
    source.close().await;
    code
}

fn setup_logging(args: &Args, config: Option<&BridgeConfig>) -> Result<(), ExitCode> {
    let level = args
        .log_level
        .clone()
        .or_else(|| config.map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let file = args
        .log_file
        .clone()
        .or_else(|| config.and_then(|c| c.logging.file.clone()));

    init_logging(&level, file.as_deref()).map_err(|e| {
        eprintln!("Cannot open log file: {}", e);
        ExitCode::from(1)
    })
}

async fn run_bridge(config: BridgeConfig, channel: Option<Arc<ConfigChannel<AnySource>>>) -> ExitCode {
    let name = config.name.clone();
    let bridge = match Bridge::from_config(config) {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::error!(bridge = %name, "Cannot build bridge: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = bridge.start().await {
        tracing::error!(bridge = %name, "Startup failed: {}", e);
        return ExitCode::from(1);
    }

    if let Some(channel) = &channel {
        if let Err(e) = bridge.attach_updates(channel).await {
            tracing::error!(bridge = %name, "Cannot subscribe to transform updates: {}", e);
            bridge.stop().await;
            return ExitCode::from(1);
        }
    }

    let outcome = bridge.run_until(shutdown_signal()).await;
    tracing::info!(bridge = %name, "Shutting down...");
    bridge.stop().await;

    match outcome {
        Shutdown::Requested => ExitCode::SUCCESS,
        Shutdown::Fatal(e) => {
            tracing::error!(bridge = %name, "Fatal connection failure: {}", e);
            ExitCode::from(2)
        }
    }
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = BridgeConfig::example().to_toml()?;

    let content = format!(
        r#"# Positioning bridge configuration
# Generated by posbridge gen-config
#
# Omit [destination] to publish on the source broker.

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = BridgeConfig::from_file(&config_path)?;
    let engine = TransformEngine::new(config.transform.clone())?;

    println!("Configuration valid!");
    println!();
    println!("Bridge:      {}", config.name);
    println!("Source:      {} ({})", config.source.resolve()?, config.source.topics.join(", "));
    match &config.destination {
        Some(dest) => println!("Destination: {}", dest.resolve()?),
        None => println!("Destination: (source broker)"),
    }
    println!("Output:      {}<tag> [{}]", config.routing.dest_topic_prefix, config.transform.output_unit);
    if let Some(batch) = &config.routing.batch_topic {
        println!("Batches:     {}", batch);
    }
    println!("Matrix:{}", engine.matrix());
    Ok(())
}

fn cmd_transform(
    config_path: PathBuf,
    inverse: bool,
    x: f64,
    y: f64,
    z: Option<f64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = BridgeConfig::from_file(&config_path)?;
    let unit = config.transform.output_unit;
    let engine = TransformEngine::new(config.transform)?;

    if inverse {
        let (sx, sy) = engine.inverse(x, y)?;
        println!("({:.3}, {:.3}) {} -> ({:.3}, {:.3}) mm", x, y, unit, sx, sy);
    } else {
        let point = engine.forward_point(x, y, z)?;
        match point.z {
            Some(pz) => println!(
                "({:.3}, {:.3}, {:.3}) mm -> ({:.3}, {:.3}, {:.3}) {} [{}]",
                x,
                y,
                z.unwrap_or_default(),
                point.x,
                point.y,
                pz,
                point.output_unit,
                point.frame_id
            ),
            None => println!(
                "({:.3}, {:.3}) mm -> ({:.3}, {:.3}) {} [{}]",
                x, y, point.x, point.y, point.output_unit, point.frame_id
            ),
        }
    }
    Ok(())
}
