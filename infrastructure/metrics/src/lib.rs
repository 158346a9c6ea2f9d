// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Process-global metrics registry.
//!
//! Components register their meters once (typically behind a `Lazy` static) and update them from
//! anywhere. The container's aggregator gathers the registry on an interval and publishes the
//! snapshot.

use once_cell::sync::Lazy;
use prometheus::{core::Collector, Encoder, Registry, TextEncoder};

pub use prometheus::{
    proto::MetricFamily,
    Histogram,
    HistogramOpts,
    HistogramVec,
    IntCounter,
    IntCounterVec,
    IntGauge,
    IntGaugeVec,
    Opts,
};

static DEFAULT_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

#[derive(Debug, thiserror::Error)]
#[error("metrics error: {0}")]
pub struct MetricsError(#[from] prometheus::Error);

pub fn registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

/// Gather all metric families registered with the default registry.
pub fn gather() -> Vec<MetricFamily> {
    DEFAULT_REGISTRY.gather()
}

/// Render the current contents of the default registry in the prometheus text exposition format.
pub fn text_snapshot() -> Result<String, MetricsError> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&gather(), &mut buf)?;
    // TextEncoder output is always valid UTF-8
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn register<C: Collector + Clone + 'static>(collector: C) -> Result<C, MetricsError> {
    DEFAULT_REGISTRY.register(Box::new(collector.clone()))?;
    Ok(collector)
}

pub fn register_int_counter(name: &str, help: &str) -> Result<IntCounter, MetricsError> {
    register(IntCounter::new(name, help)?)
}

pub fn register_int_counter_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntCounterVec, MetricsError> {
    register(IntCounterVec::new(Opts::new(name, help), label_names)?)
}

pub fn register_int_gauge(name: &str, help: &str) -> Result<IntGauge, MetricsError> {
    register(IntGauge::new(name, help)?)
}

pub fn register_int_gauge_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntGaugeVec, MetricsError> {
    register(IntGaugeVec::new(Opts::new(name, help), label_names)?)
}

pub fn register_histogram(name: &str, help: &str) -> Result<Histogram, MetricsError> {
    register(Histogram::with_opts(HistogramOpts::new(name, help))?)
}

pub fn register_histogram_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<HistogramVec, MetricsError> {
    register(HistogramVec::new(HistogramOpts::new(name, help), label_names)?)
}
