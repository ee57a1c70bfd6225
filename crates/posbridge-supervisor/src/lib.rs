// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Positioning bridge supervisor
//!
//! Watches the `app` document of a configuration source, renders each valid
//! version to a bridge configuration file, and keeps one `posbridge` worker
//! running against it.
//!
//! - A document identical to the running one is ignored.
//! - A changed document is written atomically, then the worker is restarted.
//! - A worker that exits on its own is restarted after a delay.
//!
//! ```bash
//! posbridge-supervisor --source mqtt://control.local/site-a --config-out /run/posbridge.toml
//! ```

pub mod config;
pub mod render;
pub mod supervisor;
pub mod worker;

pub use config::SupervisorConfig;
pub use render::{render, write_atomic, RenderedConfig};
pub use supervisor::{ApplyOutcome, HealthOutcome, Supervisor, SupervisorState};
pub use worker::{ProcessLauncher, WorkerExit, WorkerHandle, WorkerLauncher, WorkerProcess};

use posbridge::source::SourceError;
use posbridge::ConfigError;
use thiserror::Error;

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Bridge configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid supervisor settings: {0}")]
    Invalid(String),

    #[error("Cannot start worker: {0}")]
    Spawn(String),

    #[error("Cannot stop worker: {0}")]
    Stop(String),

    #[error("Configuration source: {0}")]
    Source(#[from] SourceError),

    #[error("No configuration received yet")]
    NoConfiguration,

    #[error("Supervisor is stopped")]
    Stopped,
}
