//! Utilization Store (C1, spec.md §4.1): a per-node bounded ring of
//! timestamped CPU/memory samples with a rolling average, shared between a
//! single writer (the Sampler) and many concurrent readers.
//!
//! The whole map and the records within it are guarded by one
//! `std::sync::RwLock` (spec.md §5). The lock is always released before any
//! `.await` point — every method here is synchronous, and callers hold the
//! store only across plain in-memory work. On append, the sample sequence is
//! replaced wholesale rather than mutated in place, so a reader holding an
//! `Arc`-free clone from `snapshot()` never observes a write that started
//! after its read returned (spec.md §3, §5, §9).

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// An immutable, once-appended observation (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub timestamp: DateTime<Utc>,
    /// Percentage (0-100) of node allocatable CPU in use at sample time.
    pub cpu_percent: f64,
    /// Percentage (0-100) of node allocatable memory in use at sample time.
    pub memory_percent: f64,
}

/// One tracked node's rolling utilization (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUtilization {
    pub node_name: String,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub is_underutilized: bool,
    pub last_updated: DateTime<Utc>,
    samples: Vec<UtilizationSample>,
}

impl NodeUtilization {
    fn new(node_name: String, sample: UtilizationSample) -> Self {
        Self {
            node_name,
            cpu_utilization: 0.0,
            memory_utilization: 0.0,
            is_underutilized: false,
            last_updated: sample.timestamp,
            samples: vec![sample],
        }
    }

    /// Samples whose `timestamp >= now - window`, oldest first.
    pub fn samples_in_window(&self, window: Duration, now: DateTime<Utc>) -> Vec<UtilizationSample> {
        let cutoff = now - window;
        self.samples
            .iter()
            .copied()
            .filter(|s| s.timestamp >= cutoff)
            .collect()
    }

    pub fn all_samples(&self) -> &[UtilizationSample] {
        &self.samples
    }
}

/// Per-node bounded ring of samples plus rolling averages, shared across a
/// Sampler writer and many reader callers (spec.md §4.1, §5).
#[derive(Default)]
pub struct UtilizationStore {
    inner: RwLock<HashMap<String, NodeUtilization>>,
    max_samples: usize,
}

impl UtilizationStore {
    pub fn new(max_samples: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_samples,
        }
    }

    /// Appends a sample for `node`, bounding the sequence at `max_samples`
    /// by constructing a fresh `Vec` (copy-then-extend) rather than mutating
    /// the previously shared backing storage in place (spec.md §4.1, §5).
    /// Recomputes the rolling averages and `is_underutilized` using the
    /// thresholds and window supplied by the caller (the policy engine).
    pub fn append_sample(
        &self,
        node: &str,
        sample: UtilizationSample,
        cpu_threshold: f64,
        memory_threshold: f64,
        window: Duration,
    ) {
        let mut guard = self.inner.write().expect("UtilizationStore lock poisoned");
        match guard.get_mut(node) {
            Some(existing) => {
                let mut fresh: Vec<UtilizationSample> = Vec::with_capacity(self.max_samples);
                let start = existing.samples.len().saturating_sub(self.max_samples - 1);
                fresh.extend_from_slice(&existing.samples[start..]);
                fresh.push(sample);
                if fresh.len() > self.max_samples {
                    let overflow = fresh.len() - self.max_samples;
                    fresh.drain(0..overflow);
                }
                existing.samples = fresh;
                existing.last_updated = sample.timestamp;
                recompute_rolling(existing, cpu_threshold, memory_threshold, window, sample.timestamp);
            }
            None => {
                let mut nu = NodeUtilization::new(node.to_string(), sample);
                recompute_rolling(&mut nu, cpu_threshold, memory_threshold, window, sample.timestamp);
                guard.insert(node.to_string(), nu);
            }
        }
        debug!("appended utilization sample for node {node}");
    }

    /// Independent deep copy of a node's utilization record, or `None` if
    /// untracked. The caller may hold the result arbitrarily long: mutations
    /// to the store afterward never alter it (spec.md §4.1, §8).
    pub fn snapshot(&self, node: &str) -> Option<NodeUtilization> {
        let guard = self.inner.read().expect("UtilizationStore lock poisoned");
        guard.get(node).cloned()
    }

    /// Independent deep copies of every node currently flagged
    /// `is_underutilized` (spec.md §4.1).
    pub fn list_underutilized(&self) -> Vec<NodeUtilization> {
        let guard = self.inner.read().expect("UtilizationStore lock poisoned");
        guard
            .values()
            .filter(|nu| nu.is_underutilized)
            .cloned()
            .collect()
    }

    /// Drops every tracked node whose name is not in `live_nodes` (spec.md
    /// §4.2 step 2: garbage collection of deleted nodes).
    pub fn garbage_collect(&self, live_nodes: &std::collections::HashSet<String>) {
        let mut guard = self.inner.write().expect("UtilizationStore lock poisoned");
        guard.retain(|name, _| live_nodes.contains(name));
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("UtilizationStore lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn recompute_rolling(
    nu: &mut NodeUtilization,
    cpu_threshold: f64,
    memory_threshold: f64,
    window: Duration,
    now: DateTime<Utc>,
) {
    let in_window = nu.samples_in_window(window, now);
    if in_window.is_empty() {
        nu.cpu_utilization = 0.0;
        nu.memory_utilization = 0.0;
        nu.is_underutilized = false;
        return;
    }
    let count = in_window.len() as f64;
    nu.cpu_utilization = in_window.iter().map(|s| s.cpu_percent).sum::<f64>() / count;
    nu.memory_utilization = in_window.iter().map(|s| s.memory_percent).sum::<f64>() / count;
    nu.is_underutilized = nu.cpu_utilization < cpu_threshold && nu.memory_utilization < memory_threshold;
}
