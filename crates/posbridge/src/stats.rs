// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Message counters, shared by every delivery context.
///
/// Each report element moves `total` once and exactly one of `success`,
/// `failed` or `malformed` once.
#[derive(Debug)]
pub struct BridgeStats {
    /// Report elements seen.
    pub total: AtomicU64,

    /// Elements transformed and accepted by the publish queue.
    pub success: AtomicU64,

    /// Elements dropped by a transform or enqueue failure.
    pub failed: AtomicU64,

    /// Elements dropped as undecodable.
    pub malformed: AtomicU64,

    /// Accumulated processing time of successful elements (microseconds).
    pub processing_us: AtomicU64,

    /// Creation time.
    pub created: Instant,
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeStats {
    /// Create zeroed stats.
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            processing_us: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Record a successful element.
    pub fn record_success(&self, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.success.fetch_add(1, Ordering::Relaxed);
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.processing_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Record a failed element.
    pub fn record_failed(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` malformed elements.
    pub fn record_malformed(&self, count: u64) {
        self.total.fetch_add(count, Ordering::Relaxed);
        self.malformed.fetch_add(count, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            processing_us: self.processing_us.load(Ordering::Relaxed),
            uptime: self.created.elapsed(),
        }
    }
}

/// Snapshot of bridge statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStatsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub malformed: u64,
    pub processing_us: u64,
    pub uptime: Duration,
}

impl BridgeStatsSnapshot {
    /// Percentage of elements that made it to the publish queue.
    pub fn success_rate(&self) -> f64 {
        if self.total > 0 {
            100.0 * self.success as f64 / self.total as f64
        } else {
            0.0
        }
    }

    /// Mean processing time per successful element (microseconds).
    pub fn avg_processing_us(&self) -> f64 {
        if self.success > 0 {
            self.processing_us as f64 / self.success as f64
        } else {
            0.0
        }
    }

    /// Successful elements per second of uptime.
    pub fn messages_per_second(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.success as f64 / secs
        } else {
            0.0
        }
    }

    /// Emit the snapshot as one structured log event.
    pub fn log(&self, name: &str) {
        tracing::info!(
            bridge = name,
            uptime_secs = self.uptime.as_secs(),
            total = self.total,
            success = self.success,
            failed = self.failed,
            malformed = self.malformed,
            success_rate = format_args!("{:.2}%", self.success_rate()),
            avg_us = format_args!("{:.2}", self.avg_processing_us()),
            rate = format_args!("{:.2} msg/s", self.messages_per_second()),
            "Bridge statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counts_and_rates() {
        let stats = BridgeStats::new();
        stats.record_success(Duration::from_micros(100));
        stats.record_success(Duration::from_micros(300));
        stats.record_failed();
        stats.record_malformed(1);

        let snap = stats.snapshot();
        assert_eq!(snap.total, 4);
        assert_eq!(snap.success, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.malformed, 1);
        assert_eq!(snap.processing_us, 400);
        assert_eq!(snap.success_rate(), 50.0);
        assert_eq!(snap.avg_processing_us(), 200.0);
    }

    #[test]
    fn test_empty_rates_are_zero() {
        let snap = BridgeStats::new().snapshot();
        assert_eq!(snap.success_rate(), 0.0);
        assert_eq!(snap.avg_processing_us(), 0.0);
    }

    #[test]
    fn test_concurrent_counting() {
        let stats = Arc::new(BridgeStats::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        match i % 3 {
                            0 => stats.record_success(Duration::from_micros(1)),
                            1 => stats.record_failed(),
                            _ => stats.record_malformed(1),
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("join");
        }

        let snap = stats.snapshot();
        assert_eq!(snap.total, 80_000);
        assert_eq!(snap.success + snap.failed + snap.malformed, snap.total);
        assert_eq!(snap.success, 30_000);
        assert_eq!(snap.processing_us, 30_000);
    }
}
