//! Safety Verifier (C4, spec.md §4.4): an ordered, fail-fast pipeline gating
//! removal of a single candidate node. The first check that blocks returns
//! its reason; the verifier never mutates cluster state, and any transient
//! cluster-API failure while gathering inputs fails closed (spec.md §7).

mod affinity;
mod capacity_after_removal;
mod local_storage;
mod protected;
mod reschedulability;
mod system_pods;

use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{BlockReason, SafetyBlock};
use crate::k8s::ClusterClient;

pub struct SafetyVerifier<C: ClusterClient> {
    cluster: Arc<C>,
    reschedulability_headroom_multiplier: f64,
    post_removal_utilization_ceiling_percent: f64,
    extended_scheduling_simulation: bool,
}

impl<C: ClusterClient> SafetyVerifier<C> {
    pub fn new(cluster: Arc<C>, config: &EngineConfig) -> Self {
        Self {
            cluster,
            reschedulability_headroom_multiplier: config.reschedulability_headroom_multiplier,
            post_removal_utilization_ceiling_percent: config.post_removal_utilization_ceiling_percent,
            extended_scheduling_simulation: config.extended_scheduling_simulation,
        }
    }

    /// Runs the full ordered pipeline (spec.md §4.4 steps 1-6) against a
    /// candidate node and its current pods.
    pub async fn verify(&self, node: &Node, candidate_pods: &[Pod]) -> Result<(), SafetyBlock> {
        let node_name = node.metadata.name.clone().unwrap_or_default();

        local_storage::check(candidate_pods, self.cluster.as_ref()).await?;

        let other_nodes = self
            .cluster
            .list_ready_schedulable_nodes(&node_name)
            .await
            .map_err(|e| {
                SafetyBlock::new(BlockReason::Capacity, format!("failed to list other nodes, failing closed: {e}"))
            })?;

        let all_pods = self.cluster.list_pods(None).await.map_err(|e| {
            SafetyBlock::new(BlockReason::Capacity, format!("failed to list cluster pods, failing closed: {e}"))
        })?;
        let pods_by_node = bucket_pods_by_node(&all_pods);

        reschedulability::check(
            candidate_pods,
            &other_nodes,
            &pods_by_node,
            self.reschedulability_headroom_multiplier,
        )?;
        system_pods::check(candidate_pods)?;
        affinity::check(
            node,
            candidate_pods,
            &other_nodes,
            &all_pods,
            &pods_by_node,
            self.extended_scheduling_simulation,
        )?;
        capacity_after_removal::check(
            candidate_pods,
            &other_nodes,
            &pods_by_node,
            self.post_removal_utilization_ceiling_percent,
        )?;
        protected::check(node)?;

        Ok(())
    }
}

fn bucket_pods_by_node(pods: &[Pod]) -> HashMap<String, Vec<Pod>> {
    let mut map: HashMap<String, Vec<Pod>> = HashMap::new();
    for pod in pods {
        if let Some(name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
            map.entry(name).or_default().push(pod.clone());
        }
    }
    map
}

/// Sum of container resource requests across `pods` (CPU millicores, memory
/// bytes), shared by the reschedulability and capacity-after-removal checks.
fn sum_requests(pods: &[Pod]) -> (i64, i64) {
    let mut cpu = 0i64;
    let mut mem = 0i64;
    for pod in pods {
        let Some(spec) = &pod.spec else { continue };
        for container in &spec.containers {
            let Some(resources) = &container.resources else { continue };
            let Some(requests) = &resources.requests else { continue };
            if let Some(q) = requests.get("cpu") {
                cpu += crate::utils::resource_quantity::parse_cpu_str(&q.0).unwrap_or(0);
            }
            if let Some(q) = requests.get("memory") {
                mem += crate::utils::resource_quantity::parse_memory_str(&q.0).unwrap_or(0);
            }
        }
    }
    (cpu, mem)
}

fn node_allocatable(node: &Node) -> (i64, i64) {
    let Some(alloc) = node.status.as_ref().and_then(|s| s.allocatable.as_ref()) else {
        return (0, 0);
    };
    (
        alloc.get("cpu").and_then(|q| crate::utils::resource_quantity::parse_cpu_str(&q.0)).unwrap_or(0),
        alloc
            .get("memory")
            .and_then(|q| crate::utils::resource_quantity::parse_memory_str(&q.0))
            .unwrap_or(0),
    )
}
