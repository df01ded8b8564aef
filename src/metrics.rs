//! Prometheus metrics for chunk operations and shard growth
//!
//! Metrics live in a process-wide registry. Operation and cache counters
//! are shared by every store in the process; shard gauges carry a `store`
//! label holding the storage directory.

use crate::error::Result;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Once;
use tracing::error;

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref OPERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chunkstore_operations_total", "Chunk store operations by outcome"),
        &["op", "status"]
    ).unwrap();

    pub static ref CACHE_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chunkstore_cache_lookups_total", "Read cache lookups"),
        &["result"]
    ).unwrap();

    pub static ref SHARD_CAPACITY_BYTES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chunkstore_shard_capacity_bytes", "Shard file size in bytes"),
        &["store", "shard"]
    ).unwrap();

    pub static ref SHARD_FREE_SLOTS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chunkstore_shard_free_slots", "Reclaimable slots per shard"),
        &["store", "shard"]
    ).unwrap();
}

static INIT: Once = Once::new();

/// Register all metrics with the global registry (idempotent)
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(OPERATIONS_TOTAL.clone()),
            Box::new(CACHE_LOOKUPS_TOTAL.clone()),
            Box::new(SHARD_CAPACITY_BYTES.clone()),
            Box::new(SHARD_FREE_SLOTS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = METRICS_REGISTRY.register(collector) {
                error!("Failed to register metric: {}", e);
            }
        }
    });
}

/// Render the registry in the Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&METRICS_REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Count one operation outcome
pub fn record_op<T>(op: &str, result: &Result<T>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) if e.is_not_found() => "not_found",
        Err(_) => "error",
    };
    OPERATIONS_TOTAL.with_label_values(&[op, status]).inc();
}

pub fn record_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_shard(store: &str, shard: u8, capacity: u64, free_slots: usize) {
    let label = shard.to_string();
    SHARD_CAPACITY_BYTES
        .with_label_values(&[store, label.as_str()])
        .set(capacity as i64);
    SHARD_FREE_SLOTS
        .with_label_values(&[store, label.as_str()])
        .set(free_slots as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_series() {
        init_metrics();
        init_metrics();

        record_op("put", &Ok::<(), crate::Error>(()));
        record_cache(false);
        record_shard("/data/a", 7, 8192, 1);

        let text = export_metrics();
        assert!(text.contains("chunkstore_operations_total"));
        assert!(text.contains("chunkstore_cache_lookups_total"));
        assert!(text.contains("chunkstore_shard_capacity_bytes{"));
        assert!(text.contains("store=\"/data/a\""));
    }

    #[test]
    fn test_shard_gauges_are_per_store() {
        init_metrics();

        record_shard("/data/left", 0, 4096, 0);
        record_shard("/data/right", 0, 65536, 3);

        let left = SHARD_CAPACITY_BYTES.with_label_values(&["/data/left", "0"]).get();
        let right = SHARD_CAPACITY_BYTES.with_label_values(&["/data/right", "0"]).get();
        assert_eq!(left, 4096);
        assert_eq!(right, 65536);
        assert_eq!(
            SHARD_FREE_SLOTS.with_label_values(&["/data/right", "0"]).get(),
            3
        );
    }
}
