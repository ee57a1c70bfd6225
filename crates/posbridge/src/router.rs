// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message router.
//!
//! Turns inbound position reports into transformed outbound reports. The
//! router runs inside each connection's delivery context, so nothing here
//! blocks: decoding, one transform under a read lock, and a non-blocking
//! enqueue on the publisher.

use crate::config::RoutingConfig;
use crate::connection::{ConnectionError, Publisher};
use crate::report::{parse_payload, Payload, PositionReport, ReportError};
use crate::stats::BridgeStats;
use crate::transform::{TransformEngine, TransformError};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Why one report element was dropped.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Malformed(#[from] ReportError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Enqueue failed: {0}")]
    Publish(#[from] ConnectionError),

    #[error("Router shutting down")]
    ShuttingDown,
}

/// A transformed element, ready to publish.
struct Routed {
    tag_id: String,
    value: Value,
}

/// Transforms and republishes position reports.
pub struct MessageRouter {
    engine: Arc<TransformEngine>,
    publisher: Arc<dyn Publisher>,
    routing: RoutingConfig,
    stats: Arc<BridgeStats>,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

impl MessageRouter {
    /// Create a stopped router.
    pub fn new(
        engine: Arc<TransformEngine>,
        publisher: Arc<dyn Publisher>,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            engine,
            publisher,
            routing,
            stats: Arc::new(BridgeStats::new()),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Begin accepting deliveries.
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Stop accepting deliveries. Irreversible.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Check if the router accepts deliveries.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shutting_down.load(Ordering::SeqCst)
    }

    /// Shared statistics.
    pub fn stats(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    /// Handle one delivery. Never panics, never blocks.
    pub fn on_message(&self, topic: &str, payload: &[u8]) {
        if !self.is_running() {
            return;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| self.route(topic, payload)));
        if outcome.is_err() {
            self.stats.record_failed();
            tracing::error!(topic, "Panic while routing message, dropped");
        }
    }

    fn route(&self, topic: &str, payload: &[u8]) {
        let started = Instant::now();

        let payload = match parse_payload(payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_malformed(1);
                tracing::warn!(topic, "Malformed message: {}", e);
                return;
            }
        };

        match payload {
            Payload::Single(value) => {
                let result = self
                    .transform(value, topic)
                    .and_then(|routed| self.publish_one(routed));
                self.record(topic, result, started);
            }
            Payload::Batch(items) if self.routing.batch_topic.is_some() => {
                self.route_batch(topic, items, started);
            }
            Payload::Batch(items) => {
                for item in items {
                    let element_start = Instant::now();
                    let result = self
                        .transform(item, topic)
                        .and_then(|routed| self.publish_one(routed));
                    self.record(topic, result, element_start);
                }
            }
        }
    }

    /// Transform every element, then publish the survivors as one array.
    fn route_batch(&self, topic: &str, items: Vec<Value>, started: Instant) {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match self.transform(item, topic) {
                Ok(routed) => out.push(routed.value),
                Err(e) => self.record(topic, Err(e), started),
            }
        }
        if out.is_empty() {
            return;
        }

        let count = out.len();
        let batch_topic = self.routing.batch_topic.clone().unwrap_or_default();
        let result = self.ensure_running().and_then(|()| {
            let bytes = serde_json::to_vec(&Value::Array(out))?;
            self.publisher
                .publish(batch_topic, bytes, self.routing.publish_qos)?;
            Ok(())
        });

        match result {
            Ok(()) => {
                let per_element = started.elapsed() / count as u32;
                for _ in 0..count {
                    self.stats.record_success(per_element);
                }
                tracing::debug!(topic, count, "Published batch");
            }
            Err(RouteError::ShuttingDown) => {
                for _ in 0..count {
                    self.stats.record_failed();
                }
                tracing::debug!(topic, count, "Batch dropped during shutdown");
            }
            Err(e) => {
                for _ in 0..count {
                    self.stats.record_failed();
                }
                tracing::error!(topic, count, "Batch dropped: {}", e);
            }
        }
    }

    fn transform(&self, value: Value, topic: &str) -> Result<Routed, RouteError> {
        let report = PositionReport::from_value(value, topic)?;
        let point = self.engine.forward_point(report.x, report.y, report.z)?;
        let tag_id = report.tag_id.clone();
        let value = report.into_transformed(&point, &self.routing.strip_fields, now_ms());
        Ok(Routed { tag_id, value })
    }

    fn ensure_running(&self) -> Result<(), RouteError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RouteError::ShuttingDown);
        }
        Ok(())
    }

    fn publish_one(&self, routed: Routed) -> Result<(), RouteError> {
        self.ensure_running()?;
        let bytes = serde_json::to_vec(&routed.value)?;
        let topic = format!("{}{}", self.routing.dest_topic_prefix, routed.tag_id);
        self.publisher
            .publish(topic, bytes, self.routing.publish_qos)?;
        Ok(())
    }

    fn record(&self, topic: &str, result: Result<(), RouteError>, started: Instant) {
        match result {
            Ok(()) => self.stats.record_success(started.elapsed()),
            Err(RouteError::Malformed(e)) => {
                self.stats.record_malformed(1);
                tracing::warn!(topic, "Malformed report: {}", e);
            }
            Err(RouteError::ShuttingDown) => {
                self.stats.record_failed();
                tracing::debug!(topic, "Report dropped during shutdown");
            }
            Err(e) => {
                self.stats.record_failed();
                tracing::error!(topic, "Report dropped: {}", e);
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
