//! In-memory counters/histograms at the emission points spec.md §6 names.
//! Metrics *registration* plumbing (a Prometheus exporter, an HTTP endpoint)
//! is out of scope (spec.md §1); this recorder is the ambient instrumentation
//! layer the orchestrator/drainer/safety verifier call into, kept deliberately
//! small and dependency-free so it can back any exporter later.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::error::BlockReason;

#[derive(Debug, Default, Clone, Copy)]
struct Histogram {
    count: u64,
    sum_secs: f64,
}

/// Thread-safe counters/histograms keyed by their label tuple, rendered as a
/// flat string key. Good enough for the reconcile-loop cadence this engine
/// runs at; not intended to scale to high-cardinality label sets.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<String, u64>>,
    histograms: RwLock<HashMap<String, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn incr(&self, key: String) {
        *self.counters.write().expect("metrics lock poisoned").entry(key).or_insert(0) += 1;
    }

    fn incr_by(&self, key: String, n: u64) {
        *self.counters.write().expect("metrics lock poisoned").entry(key).or_insert(0) += n;
    }

    pub fn get_counter(&self, key: &str) -> u64 {
        self.counters.read().expect("metrics lock poisoned").get(key).copied().unwrap_or(0)
    }

    pub fn record_blocked(&self, group: &str, namespace: &str, reason: BlockReason) {
        self.incr(format!("scale_down_blocked_total{{group={group},ns={namespace},reason={}}}", reason.as_label()));
    }

    pub fn record_error(&self, group: &str, namespace: &str, kind: &str) {
        self.incr(format!("scale_down_errors_total{{group={group},ns={namespace},kind={kind}}}"));
    }

    pub fn record_scale_down(&self, group: &str, namespace: &str) {
        self.incr(format!("scale_down_total{{group={group},ns={namespace}}}"));
    }

    pub fn record_nodes_removed(&self, group: &str, namespace: &str, n: u64) {
        self.incr_by(format!("scale_down_nodes_removed{{group={group},ns={namespace}}}"), n);
    }

    pub fn record_drain_duration(&self, group: &str, namespace: &str, result: &str, duration: Duration) {
        let key = format!("node_drain_duration_seconds{{group={group},ns={namespace},result={result}}}");
        let mut guard = self.histograms.write().expect("metrics lock poisoned");
        let entry = guard.entry(key).or_default();
        entry.count += 1;
        entry.sum_secs += duration.as_secs_f64();
    }

    pub fn record_pods_evicted(&self, group: &str, namespace: &str, n: u64) {
        self.incr_by(format!("node_drain_pods_evicted{{group={group},ns={namespace}}}"), n);
    }

    pub fn record_safety_check_failure(&self, check_type: &str, group: &str, namespace: &str) {
        self.incr(format!("safety_check_failures_total{{check_type={check_type},group={group},ns={namespace}}}"));
    }
}
