// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration channel: startup fetch and live transform updates.

use crate::config::{BridgeConfig, ConfigError};
use crate::source::{ConfigSource, SourceError, APP_KEY, TRANSFORM_KEY};
use crate::transform::{TransformEngine, TransformError, TransformParameters};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Timed out after {0:?} waiting for configuration")]
    Timeout(Duration),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Reads the bridge configuration and relays transform updates.
pub struct ConfigChannel<S: ConfigSource> {
    source: Arc<S>,
    fetch_timeout: Duration,
}

impl<S: ConfigSource> ConfigChannel<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            fetch_timeout: Duration::from_secs(10),
        }
    }

    /// Bound the startup fetch.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// One-shot read of the `app` document.
    pub async fn fetch_initial(&self) -> Result<BridgeConfig, ChannelError> {
        let doc = tokio::time::timeout(self.fetch_timeout, self.source.fetch(APP_KEY))
            .await
            .map_err(|_| ChannelError::Timeout(self.fetch_timeout))??;
        let config = BridgeConfig::from_document(&doc)?;
        tracing::info!(name = %config.name, "Fetched bridge configuration");
        Ok(config)
    }

    /// Feed every pushed `transform` document into `engine`.
    ///
    /// The listener ends when the source closes the subscription.
    pub async fn subscribe_transform_updates(
        &self,
        engine: Arc<TransformEngine>,
    ) -> Result<JoinHandle<()>, ChannelError> {
        let mut updates = self.source.watch(TRANSFORM_KEY).await?;
        Ok(tokio::spawn(async move {
            while let Some(doc) = updates.recv().await {
                let _ = apply_transform_document(&engine, &doc);
            }
            tracing::debug!("Transform update listener stopped");
        }))
    }
}

/// Parse a full parameter document and install it.
///
/// Failures are logged; the engine keeps its current parameters.
pub fn apply_transform_document(engine: &TransformEngine, doc: &Value) -> Result<u64, TransformError> {
    let result = TransformParameters::from_document(doc).and_then(|params| {
        let summary = format!(
            "origin=({}, {}) scale={} rotation={} flips=({}, {}) unit={}",
            params.origin_x,
            params.origin_y,
            params.scale,
            params.rotation,
            params.x_flipped,
            params.y_flipped,
            params.output_unit
        );
        engine.replace(params).map(|generation| (generation, summary))
    });

    match result {
        Ok((generation, summary)) => {
            tracing::info!(generation, "Transform parameters replaced: {}", summary);
            Ok(generation)
        }
        Err(e) => {
            tracing::warn!("Rejected transform update: {}", e);
            Err(e)
        }
    }
}
