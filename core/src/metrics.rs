// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Component meters and the metrics aggregator.
//!
//! Components register their meters lazily with the global registry. The aggregator periodically
//! harvests the registry and publishes snapshots on a broadcast channel; the `hive.get_metrics`
//! builtin returns the current snapshot on demand.

use std::time::{Duration, SystemTime};

use hive_metrics::{IntCounter, IntCounterVec, IntGauge, MetricsError};
use hive_shutdown::ShutdownSignal;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::broadcast;

const LOG_TARGET: &str = "hive::metrics";

const SNAPSHOT_CHANNEL_SIZE: usize = 8;

pub(crate) fn rpc_requests_total(subject: &str) -> IntCounter {
    static METER: Lazy<IntCounterVec> = Lazy::new(|| {
        hive_metrics::register_int_counter_vec("rpc_requests_total", "Number of RPC requests received", &[
            "subject",
        ])
        .expect("rpc_requests_total registration")
    });

    METER.with_label_values(&[subject])
}

pub(crate) fn connection_count() -> &'static IntGauge {
    static METER: Lazy<IntGauge> = Lazy::new(|| {
        hive_metrics::register_int_gauge("rpc_connection_count", "Number of open peer connections")
            .expect("rpc_connection_count registration")
    });

    &METER
}

pub(crate) fn heartbeats_total() -> &'static IntCounter {
    static METER: Lazy<IntCounter> = Lazy::new(|| {
        hive_metrics::register_int_counter("rpc_heartbeats_total", "Number of successful heartbeat round-trips")
            .expect("rpc_heartbeats_total registration")
    });

    &METER
}

pub(crate) fn proxy_timeouts_total(address: &str) -> IntCounter {
    static METER: Lazy<IntCounterVec> = Lazy::new(|| {
        hive_metrics::register_int_counter_vec("rpc_proxy_timeouts_total", "Number of proxy calls that timed out", &[
            "address",
        ])
        .expect("rpc_proxy_timeouts_total registration")
    });

    METER.with_label_values(&[address])
}

pub(crate) fn proxy_errors_total(address: &str, kind: &str) -> IntCounter {
    static METER: Lazy<IntCounterVec> = Lazy::new(|| {
        hive_metrics::register_int_counter_vec("rpc_proxy_errors_total", "Number of failed proxy calls", &[
            "address",
            "kind",
        ])
        .expect("rpc_proxy_errors_total registration")
    });

    METER.with_label_values(&[address, kind])
}

pub(crate) fn events_emitted_total(event_type: &str) -> IntCounter {
    static METER: Lazy<IntCounterVec> = Lazy::new(|| {
        hive_metrics::register_int_counter_vec("events_emitted_total", "Number of events emitted", &["type"])
            .expect("events_emitted_total registration")
    });

    METER.with_label_values(&[event_type])
}

pub(crate) fn events_handled_total(queue: &str) -> IntCounter {
    static METER: Lazy<IntCounterVec> = Lazy::new(|| {
        hive_metrics::register_int_counter_vec("events_handled_total", "Number of events handled successfully", &[
            "queue",
        ])
        .expect("events_handled_total registration")
    });

    METER.with_label_values(&[queue])
}

pub(crate) fn events_failed_total(queue: &str) -> IntCounter {
    static METER: Lazy<IntCounterVec> = Lazy::new(|| {
        hive_metrics::register_int_counter_vec("events_failed_total", "Number of events whose handler failed", &[
            "queue",
        ])
        .expect("events_failed_total registration")
    });

    METER.with_label_values(&[queue])
}

/// One harvested view of the metrics registry, in the text exposition format.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at_unix: u64,
    pub text: String,
}

/// Periodically harvests the global registry and publishes snapshots.
pub struct MetricsAggregator {
    interval: Duration,
    snapshots: broadcast::Sender<MetricsSnapshot>,
}

impl MetricsAggregator {
    pub fn new(interval: Duration) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_SIZE);
        Self { interval, snapshots }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.snapshots.subscribe()
    }

    /// Harvest the registry now.
    pub fn snapshot(&self) -> Result<MetricsSnapshot, MetricsError> {
        Ok(MetricsSnapshot {
            taken_at_unix: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            text: hive_metrics::text_snapshot()?,
        })
    }

    pub(crate) fn spawn(self: &std::sync::Arc<Self>, mut shutdown: ShutdownSignal) {
        let aggregator = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(aggregator.interval) => {},
                }
                match aggregator.snapshot() {
                    Ok(snapshot) => {
                        let _ = aggregator.snapshots.send(snapshot);
                    },
                    Err(err) => {
                        log::warn!(target: LOG_TARGET, "failed to gather metrics: {}", err);
                    },
                }
            }
            log::debug!(target: LOG_TARGET, "metrics aggregator ended");
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn aggregator_publishes_snapshots() {
        rpc_requests_total("test.subject").inc();
        let aggregator = std::sync::Arc::new(MetricsAggregator::new(Duration::from_millis(20)));
        let mut snapshots = aggregator.subscribe();
        let shutdown = hive_shutdown::Shutdown::new();
        aggregator.spawn(shutdown.to_signal());
        let snapshot = tokio::time::timeout(Duration::from_secs(2), snapshots.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.text.contains("rpc_requests_total"));
    }
}
