//! Capacity-after-removal check (spec.md §4.4 step 5): predicts both the
//! cluster-wide average utilization and the worst case of a single remaining
//! node absorbing all of the candidate's pods; blocks if either predicted
//! figure exceeds the configured ceiling.

use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::HashMap;

use crate::error::{BlockReason, SafetyBlock};

use super::sum_requests;

pub fn check(
    candidate_pods: &[Pod],
    other_nodes: &[Node],
    pods_by_node: &HashMap<String, Vec<Pod>>,
    ceiling_percent: f64,
) -> Result<(), SafetyBlock> {
    if other_nodes.is_empty() {
        return Ok(());
    }
    let (cand_cpu, cand_mem) = sum_requests(candidate_pods);

    let mut total_alloc_cpu = 0i64;
    let mut total_alloc_mem = 0i64;
    let mut total_used_cpu = 0i64;
    let mut total_used_mem = 0i64;
    let mut worst_cpu_percent = 0.0f64;
    let mut worst_mem_percent = 0.0f64;

    for node in other_nodes {
        let (alloc_cpu, alloc_mem) = super::node_allocatable(node);
        let name = node.metadata.name.clone().unwrap_or_default();
        let node_pods = pods_by_node.get(&name).map(|v| v.as_slice()).unwrap_or(&[]);
        let (used_cpu, used_mem) = sum_requests(node_pods);

        total_alloc_cpu += alloc_cpu;
        total_alloc_mem += alloc_mem;
        total_used_cpu += used_cpu;
        total_used_mem += used_mem;

        if alloc_cpu > 0 {
            worst_cpu_percent = worst_cpu_percent.max(((used_cpu + cand_cpu) as f64 / alloc_cpu as f64) * 100.0);
        }
        if alloc_mem > 0 {
            worst_mem_percent = worst_mem_percent.max(((used_mem + cand_mem) as f64 / alloc_mem as f64) * 100.0);
        }
    }

    let avg_cpu_percent = if total_alloc_cpu > 0 {
        ((total_used_cpu + cand_cpu) as f64 / total_alloc_cpu as f64) * 100.0
    } else {
        0.0
    };
    let avg_mem_percent = if total_alloc_mem > 0 {
        ((total_used_mem + cand_mem) as f64 / total_alloc_mem as f64) * 100.0
    } else {
        0.0
    };

    let predicted_max_cpu = avg_cpu_percent.max(worst_cpu_percent);
    let predicted_max_mem = avg_mem_percent.max(worst_mem_percent);

    if predicted_max_cpu > ceiling_percent || predicted_max_mem > ceiling_percent {
        return Err(SafetyBlock::new(
            BlockReason::Capacity,
            format!(
                "predicted post-removal utilization {predicted_max_cpu:.1}% cpu / {predicted_max_mem:.1}% mem exceeds {ceiling_percent:.1}% ceiling"
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::tests::{node_with_allocatable, pod_with_request};

    #[test]
    fn no_other_nodes_is_vacuously_safe() {
        let result = check(&[], &[], &HashMap::new(), 85.0);
        assert!(result.is_ok());
    }

    #[test]
    fn blocks_when_worst_case_exceeds_ceiling() {
        let candidate_pods = vec![pod_with_request("p1", "3", "1Gi")];
        let other_nodes = vec![node_with_allocatable("n2", "4", "8Gi")];
        let result = check(&candidate_pods, &other_nodes, &HashMap::new(), 85.0);
        assert_eq!(result.unwrap_err().reason, BlockReason::Capacity);
    }

    #[test]
    fn allows_when_within_ceiling() {
        let candidate_pods = vec![pod_with_request("p1", "1", "1Gi")];
        let other_nodes = vec![node_with_allocatable("n2", "16", "32Gi")];
        assert!(check(&candidate_pods, &other_nodes, &HashMap::new(), 85.0).is_ok());
    }
}
