//! Process-global metrics registry. Counters are increment-only; nothing
//! here resets or decrements except the gauges that track live resource
//! counts (open inodes, tree size).

use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub backend_requests: IntCounterVec,
    pub chunk_fetches: IntCounterVec,
    pub not_found: IntCounterVec,
    pub retries: IntCounterVec,
    pub open_inodes: IntGauge,
    pub tree_size: IntGauge,
    pub last_refresh_ms: IntGauge,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let backend_requests = IntCounterVec::new(
            Opts::new("shade_backend_requests_total", "backend requests by op/backend/namespace"),
            &["op", "backend", "namespace"],
        )
        .expect("valid metric");
        let chunk_fetches = IntCounterVec::new(
            Opts::new("shade_chunk_fetches_total", "successful chunk fetches by backend"),
            &["backend"],
        )
        .expect("valid metric");
        let not_found = IntCounterVec::new(
            Opts::new("shade_not_found_total", "not-found responses by backend/namespace"),
            &["backend", "namespace"],
        )
        .expect("valid metric");
        let retries = IntCounterVec::new(
            Opts::new("shade_retries_total", "flush retry attempts by op"),
            &["op"],
        )
        .expect("valid metric");
        let open_inodes = IntGauge::new("shade_open_inodes", "currently mapped inodes").expect("valid metric");
        let tree_size = IntGauge::new("shade_tree_size", "nodes currently held by the tree").expect("valid metric");
        let last_refresh_ms = IntGauge::new("shade_last_refresh_duration_ms", "duration of the last tree refresh")
            .expect("valid metric");

        registry.register(Box::new(backend_requests.clone())).expect("register");
        registry.register(Box::new(chunk_fetches.clone())).expect("register");
        registry.register(Box::new(not_found.clone())).expect("register");
        registry.register(Box::new(retries.clone())).expect("register");
        registry.register(Box::new(open_inodes.clone())).expect("register");
        registry.register(Box::new(tree_size.clone())).expect("register");
        registry.register(Box::new(last_refresh_ms.clone())).expect("register");

        Metrics {
            registry,
            backend_requests,
            chunk_fetches,
            not_found,
            retries,
            open_inodes,
            tree_size,
            last_refresh_ms,
        }
    }
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

pub fn metrics() -> &'static Metrics {
    &METRICS
}

pub fn record_request(op: &str, backend: &str, namespace: &str) {
    metrics().backend_requests.with_label_values(&[op, backend, namespace]).inc();
}

pub fn record_not_found(backend: &str, namespace: &str) {
    metrics().not_found.with_label_values(&[backend, namespace]).inc();
}

pub fn record_chunk_fetch(backend: &str) {
    metrics().chunk_fetches.with_label_values(&[backend]).inc();
}

pub fn record_retry(op: &str) {
    metrics().retries.with_label_values(&[op]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        record_request("get", "memory", "chunk");
        let families = metrics().registry.gather();
        assert!(!families.is_empty());
    }
}
