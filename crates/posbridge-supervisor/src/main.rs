// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Positioning bridge supervisor CLI
//!
//! # Usage
//!
//! ```bash
//! posbridge-supervisor --source file:///etc/posbridge
//! posbridge-supervisor --source mqtt://control.local/site-a \
//!     --worker /usr/bin/posbridge --worker-arg=--log-level --worker-arg=debug
//! ```

use clap::Parser;
use posbridge::cli::{init_logging, shutdown_signal};
use posbridge::source::{ConfigSource, SourceSpec};
use posbridge_supervisor::{ProcessLauncher, Supervisor, SupervisorConfig};
use std::path::PathBuf;
use std::process::ExitCode;

/// Positioning bridge supervisor
#[derive(Parser, Debug)]
#[command(name = "posbridge-supervisor")]
#[command(about = "Renders bridge configuration from a source and keeps the bridge running")]
#[command(version)]
struct Args {
    /// Configuration source (file:///dir or mqtt://host[:port]/prefix)
    #[arg(short, long)]
    source: String,

    /// Bridge executable
    #[arg(short, long, default_value = "posbridge")]
    worker: PathBuf,

    /// Extra bridge argument (repeatable)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// Rendered configuration file
    #[arg(short = 'o', long, default_value = "posbridge.toml")]
    config_out: PathBuf,

    /// Worker health check interval (milliseconds)
    #[arg(long, default_value = "5000")]
    health_interval_ms: u64,

    /// Delay before restarting a crashed worker (milliseconds)
    #[arg(long, default_value = "2000")]
    restart_delay_ms: u64,

    /// Graceful stop timeout before SIGKILL (milliseconds)
    #[arg(long, default_value = "10000")]
    stop_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level, args.log_file.as_deref()) {
        eprintln!("Cannot open log file: {}", e);
        return ExitCode::from(1);
    }

    let config = SupervisorConfig {
        worker_program: args.worker,
        worker_args: args.worker_args,
        config_path: args.config_out,
        health_interval_ms: args.health_interval_ms,
        restart_delay_ms: args.restart_delay_ms,
        stop_timeout_ms: args.stop_timeout_ms,
        ..SupervisorConfig::default()
    };
    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return ExitCode::from(1);
    }

    let spec = match SourceSpec::parse(&args.source) {
        Ok(spec) => spec,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(1);
        }
    };
    let source = match spec.open("posbridge-supervisor").await {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(source = %args.source, "Cannot open configuration source: {}", e);
            return ExitCode::from(1);
        }
    };

    tracing::info!(
        source = %args.source,
        worker = %config.worker_program.display(),
        output = %config.config_path.display(),
        "Supervisor starting"
    );

    let launcher = ProcessLauncher::new(config.worker_program.clone(), config.worker_args.clone());
    let mut supervisor = Supervisor::new(config, launcher);
    let result = supervisor.run(&source, shutdown_signal()).await;
    source.close().await;

    match result {
        Ok(()) => {
            tracing::info!(restarts = supervisor.restart_count(), "Supervisor stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Supervisor failed: {}", e);
            ExitCode::from(1)
        }
    }
}
