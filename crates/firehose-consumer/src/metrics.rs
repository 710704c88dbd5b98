//! Process metrics exposed at `/metrics` in Prometheus text format.

use prometheus::{IntCounter, IntGauge, Registry};

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    pub frames_received: IntCounter,
    pub records_written: IntCounter,
    pub identity_lookups: IntCounter,
    pub identity_cache_hits: IntCounter,
    pub last_seq: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let frames_received =
            IntCounter::new("firehose_frames_received_total", "Firehose frames received").unwrap();
        let records_written =
            IntCounter::new("firehose_records_written_total", "Records written to the store").unwrap();
        let identity_lookups =
            IntCounter::new("firehose_identity_lookups_total", "Identity resolver HTTP lookups").unwrap();
        let identity_cache_hits = IntCounter::new(
            "firehose_identity_cache_hits_total",
            "Identity resolver cache hits",
        )
        .unwrap();
        let last_seq = IntGauge::new("firehose_last_seq", "Last sequence number observed").unwrap();

        registry.register(Box::new(frames_received.clone())).unwrap();
        registry.register(Box::new(records_written.clone())).unwrap();
        registry.register(Box::new(identity_lookups.clone())).unwrap();
        registry.register(Box::new(identity_cache_hits.clone())).unwrap();
        registry.register(Box::new(last_seq.clone())).unwrap();

        Self {
            registry,
            frames_received,
            records_written,
            identity_lookups,
            identity_cache_hits,
            last_seq,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
