// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge orchestration.
//!
//! Wires the transform engine, one or two broker connections, the router and
//! the live update listener together, and owns their start/stop order.

use crate::channel::{ChannelError, ConfigChannel};
use crate::config::{BridgeConfig, ConfigError};
use crate::connection::{
    ConnectionCountersSnapshot, ConnectionError, ConnectionManager, ConnectionSettings, Publisher,
    Transport,
};
use crate::mqtt::MqttTransport;
use crate::router::MessageRouter;
use crate::source::{ConfigSource, SourceError};
use crate::stats::BridgeStatsSnapshot;
use crate::transform::{TransformEngine, TransformError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Configuration source error: {0}")]
    Source(#[from] SourceError),

    #[error("Bridge already running")]
    AlreadyRunning,
}

/// Why [`Bridge::run_until`] returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Shutdown {
    /// The shutdown future completed.
    Requested,
    /// A connection exhausted its reconnect budget.
    Fatal(ConnectionError),
}

/// A configured bridge.
pub struct Bridge<T: Transport> {
    config: BridgeConfig,
    engine: Arc<TransformEngine>,
    source: Arc<ConnectionManager<T>>,
    destination: Option<Arc<ConnectionManager<T>>>,
    router: Arc<MessageRouter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge<MqttTransport> {
    /// Build a bridge over MQTT. Nothing connects until [`start`](Bridge::start).
    pub fn from_config(config: BridgeConfig) -> Result<Self, BridgeError> {
        let source = MqttTransport::new(&config.source)?;
        let destination = config
            .destination
            .as_ref()
            .map(MqttTransport::new)
            .transpose()?;
        Self::with_transports(config, source, destination)
    }
}

impl<T: Transport> Bridge<T> {
    /// Build a bridge over caller-supplied transports.
    ///
    /// `destination` must be given exactly when the configuration has a
    /// destination endpoint.
    pub fn with_transports(
        config: BridgeConfig,
        source: T,
        destination: Option<T>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        if config.destination.is_some() != destination.is_some() {
            return Err(ConfigError::Invalid(
                "destination transport does not match the configuration".into(),
            )
            .into());
        }

        let engine = Arc::new(TransformEngine::new(config.transform.clone())?);
        let routing = &config.routing;

        let source = Arc::new(ConnectionManager::new(
            format!("{}:source", config.name),
            source,
            ConnectionSettings::from_endpoint(&config.source)
                .with_queue(routing.queue_capacity, routing.publish_workers),
        ));

        let destination = match (destination, &config.destination) {
            (Some(transport), Some(endpoint)) => Some(Arc::new(ConnectionManager::new(
                format!("{}:destination", config.name),
                transport,
                ConnectionSettings::from_endpoint(endpoint)
                    .with_queue(routing.queue_capacity, routing.publish_workers),
            ))),
            _ => None,
        };

        let publisher: Arc<dyn Publisher> = match &destination {
            Some(dest) => dest.clone(),
            None => source.clone(),
        };
        let router = Arc::new(MessageRouter::new(
            engine.clone(),
            publisher,
            routing.clone(),
        ));

        let inbound = router.clone();
        source.on_message(Arc::new(move |topic: &str, payload: &[u8]| {
            inbound.on_message(topic, payload)
        }));

        Ok(Self {
            config,
            engine,
            source,
            destination,
            router,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Shared transform engine.
    pub fn engine(&self) -> Arc<TransformEngine> {
        self.engine.clone()
    }

    /// Message statistics.
    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.router.stats().snapshot()
    }

    /// Source and destination connection counters.
    pub fn connection_counters(&self) -> (ConnectionCountersSnapshot, Option<ConnectionCountersSnapshot>) {
        (
            self.source.counters(),
            self.destination.as_ref().map(|d| d.counters()),
        )
    }

    /// Connect (destination first, so nothing is received before it can be
    /// sent) and start routing.
    pub async fn start(&self) -> Result<(), BridgeError> {
        if self.router.is_running() {
            return Err(BridgeError::AlreadyRunning);
        }

        if let Some(dest) = &self.destination {
            dest.connect().await?;
        }
        if let Err(e) = self.source.connect().await {
            if let Some(dest) = &self.destination {
                dest.disconnect(Duration::ZERO).await;
            }
            return Err(e.into());
        }

        self.router.start();
        tracing::info!(
            bridge = %self.config.name,
            source = %self.config.source.address,
            destination = %self.config.sink().address,
            "Bridge started"
        );

        let interval_secs = self.config.routing.stats_interval_secs;
        if interval_secs > 0 {
            let router = self.router.clone();
            let name = self.config.name.clone();
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    router.stats().snapshot().log(&name);
                }
            });
            self.tasks.lock().push(handle);
        }

        Ok(())
    }

    /// Apply pushed transform documents from `channel` until stopped.
    pub async fn attach_updates<S: ConfigSource>(
        &self,
        channel: &ConfigChannel<S>,
    ) -> Result<(), BridgeError> {
        let handle = channel.subscribe_transform_updates(self.engine.clone()).await?;
        self.tasks.lock().push(handle);
        Ok(())
    }

    /// Run until `shutdown` completes or a connection fails for good.
    pub async fn run_until<F>(&self, shutdown: F) -> Shutdown
    where
        F: Future<Output = ()>,
    {
        let fatal = async {
            match &self.destination {
                Some(dest) => tokio::select! {
                    e = self.source.wait_fatal() => e,
                    e = dest.wait_fatal() => e,
                },
                None => self.source.wait_fatal().await,
            }
        };

        tokio::select! {
            _ = shutdown => Shutdown::Requested,
            e = fatal => Shutdown::Fatal(e),
        }
    }

    /// Stop routing, drain queued publishes, disconnect.
    pub async fn stop(&self) {
        self.router.shutdown();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }

        let grace = self.config.routing.shutdown_grace();
        self.source.disconnect(grace).await;
        if let Some(dest) = &self.destination {
            dest.disconnect(grace).await;
        }

        self.stats().log(&self.config.name);
        tracing::info!(bridge = %self.config.name, "Bridge stopped");
    }
}
