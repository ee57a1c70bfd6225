// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge configuration.
//!
//! Loaded once per process, either from a TOML/JSON file or from the `app`
//! document of a configuration source.

use crate::transform::{TransformError, TransformParameters};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML render error: {0}")]
    TomlRender(#[from] toml::ser::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid transform: {0}")]
    Transform(#[from] TransformError),
}

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2 (got {})", other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> u8 {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// Reconnect policy: fixed interval, bounded attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Failed attempts tolerated before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts (milliseconds).
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_interval_ms() -> u64 {
    5000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Wire transport selected for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Tls => "ssl",
            Self::Ws => "ws",
            Self::Wss => "wss",
        })
    }
}

/// Endpoint address after URI and flag resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// WebSocket path, always starting with `/`.
    pub path: String,
}

impl BrokerAddress {
    /// URL form used for WebSocket transports.
    pub fn ws_url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Ws | Scheme::Wss => f.write_str(&self.ws_url()),
            _ => write!(f, "{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

/// One broker endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Host name, or a full `tcp://`, `ssl://`, `ws://` or `wss://` URI.
    pub address: String,

    /// Port, used when `address` carries none.
    #[serde(default = "default_port")]
    pub port: u16,

    /// MQTT client identifier.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Subscription patterns. Empty means publish-only.
    #[serde(default)]
    pub topics: Vec<String>,

    #[serde(default)]
    pub qos: QosLevel,

    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    #[serde(default = "default_true")]
    pub clean_session: bool,

    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub websocket: bool,

    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "posbridge".to_string()
}

fn default_keepalive() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

impl EndpointConfig {
    /// Create an endpoint with default settings.
    pub fn new(address: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: default_port(),
            client_id: client_id.into(),
            username: None,
            password: None,
            topics: Vec::new(),
            qos: QosLevel::default(),
            keepalive_secs: default_keepalive(),
            clean_session: true,
            tls: false,
            websocket: false,
            ws_path: default_ws_path(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Add a subscription pattern.
    pub fn topic(mut self, pattern: impl Into<String>) -> Self {
        self.topics.push(pattern.into());
        self
    }

    /// Set credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the reconnect policy.
    pub fn reconnect(mut self, max_attempts: u32, interval_ms: u64) -> Self {
        self.reconnect = ReconnectConfig {
            max_attempts,
            interval_ms,
        };
        self
    }

    /// Resolve `address` and the transport flags into one address.
    ///
    /// A scheme in `address` wins over the `tls`/`websocket` flags; a port in
    /// `address` wins over `port`.
    pub fn resolve(&self) -> Result<BrokerAddress, ConfigError> {
        let (scheme, rest) = match self.address.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = match scheme.to_ascii_lowercase().as_str() {
                    "tcp" | "mqtt" => Scheme::Tcp,
                    "ssl" | "tls" | "mqtts" => Scheme::Tls,
                    "ws" => Scheme::Ws,
                    "wss" => Scheme::Wss,
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "unsupported scheme '{}' in address '{}'",
                            other, self.address
                        )))
                    }
                };
                (scheme, rest)
            }
            None => {
                let scheme = match (self.tls, self.websocket) {
                    (false, false) => Scheme::Tcp,
                    (true, false) => Scheme::Tls,
                    (false, true) => Scheme::Ws,
                    (true, true) => Scheme::Wss,
                };
                (scheme, self.address.as_str())
            }
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ConfigError::Invalid(format!("bad port in address '{}'", self.address))
                })?;
                (host, port)
            }
            None => (authority, self.port),
        };

        if host.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "empty host in address '{}'",
                self.address
            )));
        }
        if port == 0 {
            return Err(ConfigError::Invalid(format!(
                "port 0 for address '{}'",
                self.address
            )));
        }

        let path = match (scheme, path) {
            (Scheme::Ws | Scheme::Wss, "") => self.ws_path.clone(),
            (_, path) => path.to_string(),
        };
        let path = if path.is_empty() || path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };

        Ok(BrokerAddress {
            scheme,
            host: host.to_string(),
            port,
            path,
        })
    }

    fn validate(&self, role: &str) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{} address is empty", role)));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Invalid(format!("{} client_id is empty", role)));
        }
        if self.keepalive_secs != 0 && self.keepalive_secs < 5 {
            return Err(ConfigError::Invalid(format!(
                "{} keepalive_secs must be 0 or at least 5 (got {})",
                role, self.keepalive_secs
            )));
        }
        if self.username.is_none() && self.password.is_some() {
            return Err(ConfigError::Invalid(format!(
                "{} has a password but no username",
                role
            )));
        }
        for topic in &self.topics {
            if topic.is_empty() {
                return Err(ConfigError::Invalid(format!("{} has an empty topic", role)));
            }
        }
        self.resolve()?;
        Ok(())
    }
}

/// Message routing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Prefix of per-tag output topics.
    #[serde(default = "default_dest_prefix")]
    pub dest_topic_prefix: String,

    /// Topic for whole transformed arrays. Unset: arrays are split per tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_topic: Option<String>,

    /// Diagnostic keys removed from outbound reports.
    #[serde(default = "default_strip_fields")]
    pub strip_fields: Vec<String>,

    #[serde(default)]
    pub publish_qos: QosLevel,

    /// Bound of the outbound publish queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Dispatcher tasks draining the publish queue.
    #[serde(default = "default_publish_workers")]
    pub publish_workers: usize,

    /// Statistics logging interval (seconds, 0 = disabled).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Time allowed for queued publishes to drain on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_dest_prefix() -> String {
    "processed/".to_string()
}

fn default_strip_fields() -> Vec<String> {
    vec!["anchorData".to_string()]
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_publish_workers() -> usize {
    2
}

fn default_stats_interval() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    2000
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            dest_topic_prefix: default_dest_prefix(),
            batch_topic: None,
            strip_fields: default_strip_fields(),
            publish_qos: QosLevel::default(),
            queue_capacity: default_queue_capacity(),
            publish_workers: default_publish_workers(),
            stats_interval_secs: default_stats_interval(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl RoutingConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Logging settings. CLI flags take precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append log lines to this file instead of stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge name (for identification).
    #[serde(default = "default_bridge_name")]
    pub name: String,

    /// Broker the position reports are read from.
    pub source: EndpointConfig,

    /// Broker the transformed reports go to. Unset: publish on `source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<EndpointConfig>,

    /// Initial transform parameters.
    pub transform: TransformParameters,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_bridge_name() -> String {
    "posbridge".to_string()
}

impl BridgeConfig {
    /// Create a single-broker configuration.
    pub fn new(source: EndpointConfig, transform: TransformParameters) -> Self {
        Self {
            name: default_bridge_name(),
            source,
            destination: None,
            transform,
            routing: RoutingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file, or JSON when the extension is `.json`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config: Self = if is_json {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Build from a source document.
    pub fn from_document(doc: &serde_json::Value) -> Result<Self, ConfigError> {
        let config = Self::deserialize(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Example configuration for `gen-config`.
    pub fn example() -> Self {
        let source = EndpointConfig::new("localhost", "posbridge-source").topic("tags/+");
        let transform = TransformParameters::new(23469.39, 30305.22, 0.0414, -0.4363).flipped(true, true);
        let mut config = Self::new(source, transform);
        config.destination = Some(EndpointConfig::new("localhost", "posbridge-sink").port(1884));
        config
    }

    /// Endpoint used for publishing.
    pub fn sink(&self) -> &EndpointConfig {
        self.destination.as_ref().unwrap_or(&self.source)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source.validate("source")?;
        if self.source.topics.is_empty() {
            return Err(ConfigError::Invalid("source has no topics".into()));
        }

        if let Some(dest) = &self.destination {
            dest.validate("destination")?;
            if !dest.topics.is_empty() {
                return Err(ConfigError::Invalid(
                    "destination is publish-only and must not list topics".into(),
                ));
            }
            if dest.client_id == self.source.client_id && dest.resolve()? == self.source.resolve()? {
                return Err(ConfigError::Invalid(format!(
                    "source and destination share client_id '{}' on the same broker",
                    dest.client_id
                )));
            }
        }

        self.transform.validate()?;

        let routing = &self.routing;
        if has_wildcard(&routing.dest_topic_prefix) {
            return Err(ConfigError::Invalid(format!(
                "dest_topic_prefix '{}' contains a wildcard",
                routing.dest_topic_prefix
            )));
        }
        if let Some(batch) = &routing.batch_topic {
            if batch.is_empty() || has_wildcard(batch) {
                return Err(ConfigError::Invalid(format!(
                    "batch_topic '{}' is not a publishable topic",
                    batch
                )));
            }
        }
        if routing.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".into()));
        }
        if routing.publish_workers == 0 {
            return Err(ConfigError::Invalid("publish_workers must be > 0".into()));
        }

        Ok(())
    }
}

fn has_wildcard(topic: &str) -> bool {
    topic.contains('+') || topic.contains('#')
}
