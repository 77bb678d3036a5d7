//! Sampler (C2, spec.md §4.2): periodically pulls node/metrics listings and
//! writes samples into the Utilization Store, garbage-collecting nodes that
//! have disappeared. Individual per-node failures are logged and skipped,
//! never fatal to the whole pass.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::EngineError;
use crate::k8s::{ClusterClient, MetricsClient};
use crate::store::{UtilizationSample, UtilizationStore};
use crate::utils::resource_quantity::{parse_cpu_str, parse_memory_str};

/// Label on a Node marking it as control-plane (excluded from sampling).
const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

pub struct Sampler<C: ClusterClient, M: MetricsClient> {
    cluster: Arc<C>,
    metrics: Arc<M>,
    store: Arc<UtilizationStore>,
}

impl<C: ClusterClient, M: MetricsClient> Sampler<C, M> {
    pub fn new(cluster: Arc<C>, metrics: Arc<M>, store: Arc<UtilizationStore>) -> Self {
        Self {
            cluster,
            metrics,
            store,
        }
    }

    /// Runs one sampling pass (spec.md §4.2). A global listing failure
    /// aborts the whole pass and is reported; per-node failures are logged
    /// and skipped.
    pub async fn run_pass(
        &self,
        cpu_threshold: f64,
        memory_threshold: f64,
        window: chrono::Duration,
    ) -> Result<(), EngineError> {
        let nodes = self.cluster.list_nodes().await.map_err(|e| {
            EngineError::transient(format!("sampler: list_nodes failed, aborting pass: {e}"))
        })?;

        let live_names: HashSet<String> = nodes
            .iter()
            .filter_map(|n| n.metadata.name.clone())
            .collect();
        self.store.garbage_collect(&live_names);

        let node_metrics = match self.metrics.list_node_metrics().await {
            Ok(Some(m)) => m,
            Ok(None) => {
                warn!("sampler: metrics API unavailable, skipping pass");
                return Ok(());
            }
            Err(e) => {
                return Err(EngineError::transient(format!(
                    "sampler: list_node_metrics failed, aborting pass: {e}"
                )));
            }
        };

        let now = Utc::now();
        for node in &nodes {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            let is_control_plane = node
                .metadata
                .labels
                .as_ref()
                .map(|l| l.contains_key(CONTROL_PLANE_LABEL))
                .unwrap_or(false);
            if is_control_plane {
                continue;
            }

            let Some(metric) = node_metrics.iter().find(|m| m.node_name == name) else {
                debug!("sampler: no metrics reading for node {name}, skipping");
                continue;
            };

            let allocatable = node.status.as_ref().and_then(|s| s.allocatable.as_ref());
            let (alloc_cpu_millis, alloc_mem_bytes) = match allocatable {
                Some(alloc) => (
                    alloc.get("cpu").and_then(|q| parse_cpu_str(&q.0)).unwrap_or(0),
                    alloc.get("memory").and_then(|q| parse_memory_str(&q.0)).unwrap_or(0),
                ),
                None => {
                    warn!("sampler: node {name} has no allocatable status, skipping");
                    continue;
                }
            };
            if alloc_cpu_millis <= 0 || alloc_mem_bytes <= 0 {
                warn!("sampler: node {name} has zero allocatable resources, skipping");
                continue;
            }

            let used_cpu_millis = parse_cpu_str(&metric.cpu_usage).unwrap_or(0);
            let used_mem_bytes = parse_memory_str(&metric.memory_usage).unwrap_or(0);

            let cpu_percent = (used_cpu_millis as f64 / alloc_cpu_millis as f64) * 100.0;
            let memory_percent = (used_mem_bytes as f64 / alloc_mem_bytes as f64) * 100.0;

            let sample = UtilizationSample {
                timestamp: now,
                cpu_percent,
                memory_percent,
            };
            self.store
                .append_sample(&name, sample, cpu_threshold, memory_threshold, window);
        }

        info!("sampler: pass complete, {} node(s) tracked", self.store.len());
        Ok(())
    }
}
