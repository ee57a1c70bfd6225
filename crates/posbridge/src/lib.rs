// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Positioning bridge
//!
//! Subscribes to tag position reports on an MQTT broker, re-projects their
//! coordinates into a floorplan frame, and republishes them, possibly on a
//! second broker. Transform parameters can be replaced live.
//!
//! # Features
//!
//! - **Floorplan Transform**: translate, rotate, scale and flip with a cached
//!   inverse, hot-swappable under load
//! - **Vendor Formats**: five coordinate layouts, batched arrays, passthrough
//!   of every other field
//! - **Resilient Connections**: bounded reconnect with resubscription, bounded
//!   publish queue
//! - **Live Configuration**: file directory or retained MQTT topics
//!
//! # Quick Start
//!
//! ```bash
//! # Using config file
//! posbridge --config posbridge.toml
//!
//! # Configuration and transform updates from a control broker
//! posbridge --source mqtt://control.local/site-a
//!
//! # Convert one point with a config's transform
//! posbridge transform --config posbridge.toml 4396 17537
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! name = "site-a"
//!
//! [source]
//! address = "localhost"
//! topics = ["tags/+"]
//!
//! [transform]
//! origin_x = 23469.39
//! origin_y = 30305.22
//! scale = 0.0414
//! rotation = -0.4363
//! x_flipped = true
//! y_flipped = true
//!
//! [routing]
//! dest_topic_prefix = "processed/"
//! ```

pub mod bridge;
pub mod channel;
pub mod cli;
pub mod config;
pub mod connection;
pub mod mock;
pub mod mqtt;
pub mod report;
pub mod router;
pub mod source;
pub mod stats;
pub mod transform;

pub use bridge::{Bridge, BridgeError, Shutdown};
pub use channel::ConfigChannel;
pub use config::{BridgeConfig, ConfigError, EndpointConfig, QosLevel, RoutingConfig};
pub use connection::{ConnectionError, ConnectionManager, ConnectionState, Publisher, Transport};
pub use router::MessageRouter;
pub use source::{AnySource, ConfigSource, FileSource, MqttSource, SourceSpec};
pub use stats::{BridgeStats, BridgeStatsSnapshot};
pub use transform::{OutputUnit, TransformEngine, TransformError, TransformParameters};
