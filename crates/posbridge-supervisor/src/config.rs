// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Supervisor configuration.

use crate::SupervisorError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Supervisor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Bridge executable.
    #[serde(default = "default_worker_program")]
    pub worker_program: PathBuf,

    /// Extra arguments, placed before `--config <file>`.
    #[serde(default)]
    pub worker_args: Vec<String>,

    /// Where the rendered bridge configuration is written.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Worker liveness poll interval (milliseconds).
    #[serde(default = "default_health_interval")]
    pub health_interval_ms: u64,

    /// Pause before respawning a crashed worker (milliseconds).
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Time allowed for a graceful worker stop (milliseconds).
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    /// Time a fresh worker must survive to count as started (milliseconds).
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,
}

fn default_worker_program() -> PathBuf {
    PathBuf::from("posbridge")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("posbridge.toml")
}

fn default_health_interval() -> u64 {
    5000
}

fn default_restart_delay() -> u64 {
    2000
}

fn default_stop_timeout() -> u64 {
    10_000
}

fn default_startup_grace() -> u64 {
    500
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            config_path: default_config_path(),
            health_interval_ms: default_health_interval(),
            restart_delay_ms: default_restart_delay(),
            stop_timeout_ms: default_stop_timeout(),
            startup_grace_ms: default_startup_grace(),
        }
    }
}

impl SupervisorConfig {
    /// Set the rendered configuration path.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.worker_program.as_os_str().is_empty() {
            return Err(SupervisorError::Invalid("worker program is empty".into()));
        }
        if self.config_path.file_name().is_none() {
            return Err(SupervisorError::Invalid(format!(
                "config path '{}' has no file name",
                self.config_path.display()
            )));
        }
        if self.health_interval_ms == 0 {
            return Err(SupervisorError::Invalid("health interval must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.health_interval(), Duration::from_secs(5));
        assert_eq!(config.restart_delay(), Duration::from_secs(2));
        assert_eq!(config.stop_timeout(), Duration::from_secs(10));
        assert_eq!(config.startup_grace(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = SupervisorConfig::default();
        config.health_interval_ms = 0;
        assert!(config.validate().is_err());

        let config = SupervisorConfig::default().config_path("/");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json() {
        let config: SupervisorConfig =
            serde_json::from_str(r#"{"worker_args": ["--log-level", "debug"]}"#).expect("parse");
        assert_eq!(config.worker_args.len(), 2);
        assert_eq!(config.restart_delay_ms, 2000);
    }
}
