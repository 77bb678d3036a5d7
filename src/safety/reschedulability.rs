//! Reschedulability / capacity check (spec.md §4.4 step 2): block unless the
//! other ready, schedulable nodes have enough free CPU/memory — beyond a
//! configured headroom multiplier — to absorb the candidate's pods.

use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::HashMap;

use crate::error::{BlockReason, SafetyBlock};

use super::sum_requests;

pub fn check(
    candidate_pods: &[Pod],
    other_nodes: &[Node],
    pods_by_node: &HashMap<String, Vec<Pod>>,
    headroom_multiplier: f64,
) -> Result<(), SafetyBlock> {
    let (req_cpu, req_mem) = sum_requests(candidate_pods);
    let needed_cpu = (req_cpu as f64 * headroom_multiplier).ceil() as i64;
    let needed_mem = (req_mem as f64 * headroom_multiplier).ceil() as i64;

    let mut free_cpu = 0i64;
    let mut free_mem = 0i64;
    for node in other_nodes {
        let (alloc_cpu, alloc_mem) = super::node_allocatable(node);
        let name = node.metadata.name.clone().unwrap_or_default();
        let node_pods = pods_by_node.get(&name).map(|v| v.as_slice()).unwrap_or(&[]);
        let (used_cpu, used_mem) = sum_requests(node_pods);
        free_cpu += (alloc_cpu - used_cpu).max(0);
        free_mem += (alloc_mem - used_mem).max(0);
    }

    if free_cpu < needed_cpu || free_mem < needed_mem {
        return Err(SafetyBlock::new(
            BlockReason::Capacity,
            format!(
                "insufficient reschedule capacity: need {needed_cpu}m cpu / {needed_mem}B mem (headroom {headroom_multiplier}x), have {free_cpu}m / {free_mem}B free across {} node(s)",
                other_nodes.len()
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
    fn blocks_when_insufficient_free_capacity() {
        let candidate_pods = vec![pod_with_request("p1", "2", "2Gi")];
        let other_nodes = vec![node_with_allocatable("n2", "1", "1Gi")];
        let pods_by_node = HashMap::new();
        let result = check(&candidate_pods, &other_nodes, &pods_by_node, 1.2);
        assert_eq!(result.unwrap_err().reason, BlockReason::Capacity);
    }

    #[test]
    fn allows_when_sufficient_free_capacity() {
        let candidate_pods = vec![pod_with_request("p1", "1", "1Gi")];
        let other_nodes = vec![node_with_allocatable("n2", "8", "16Gi")];
        let pods_by_node = HashMap::new();
        assert!(check(&candidate_pods, &other_nodes, &pods_by_node, 1.2).is_ok());
    }
}
