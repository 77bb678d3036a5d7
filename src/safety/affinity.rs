//! Anti-affinity check (spec.md §4.4 step 4, extended form §4.4.1): the
//! simple form is a conservative hostname-topology approximation; the
//! extended form simulates per-pod placement feasibility (node-selector,
//! node-affinity, taint tolerations, pod anti-affinity) and is gated behind
//! `extended_scheduling_simulation` (spec.md §9's scheduler-fidelity
//! trade-off).

use k8s_openapi::api::core::v1::{Node, Pod, Taint, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::{BTreeMap, HashMap};

use crate::error::{BlockReason, SafetyBlock};
use crate::utils::label_selector;

const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
const MIN_NODES_FOR_HOSTNAME_ANTI_AFFINITY: usize = 3;

pub fn check(
    candidate_node: &Node,
    candidate_pods: &[Pod],
    other_nodes: &[Node],
    all_pods: &[Pod],
    pods_by_node: &HashMap<String, Vec<Pod>>,
    extended: bool,
) -> Result<(), SafetyBlock> {
    if extended {
        extended_check(candidate_pods, other_nodes, pods_by_node)
    } else {
        simple_check(candidate_node, candidate_pods, other_nodes, all_pods)
    }
}

/// Conservative approximation (spec.md §4.4 step 4): any required hostname-
/// topology anti-affinity term with cluster-wide matches demands at least 3
/// ready/schedulable nodes total.
fn simple_check(
    candidate_node: &Node,
    candidate_pods: &[Pod],
    other_nodes: &[Node],
    all_pods: &[Pod],
) -> Result<(), SafetyBlock> {
    for pod in candidate_pods {
        let Some(terms) = required_anti_affinity_terms(pod) else {
            continue;
        };
        for term in terms {
            if term.topology_key != HOSTNAME_TOPOLOGY_KEY {
                continue;
            }
            let Some(selector) = &term.label_selector else {
                continue;
            };
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            let has_cluster_wide_match = all_pods.iter().any(|other| {
                other.metadata.uid != pod.metadata.uid
                    && labels_match(selector, other)
            });
            if !has_cluster_wide_match {
                continue;
            }
            let total_nodes = other_nodes.len() + 1;
            if total_nodes < MIN_NODES_FOR_HOSTNAME_ANTI_AFFINITY {
                let node_name = candidate_node.metadata.name.clone().unwrap_or_default();
                return Err(SafetyBlock::new(
                    BlockReason::Affinity,
                    format!(
                        "pod {pod_name} on node {node_name} has required hostname anti-affinity with cluster-wide matches and only {total_nodes} ready/schedulable node(s) total (need {MIN_NODES_FOR_HOSTNAME_ANTI_AFFINITY})"
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Extended per-pod feasibility simulation (spec.md §4.4.1).
fn extended_check(
    candidate_pods: &[Pod],
    other_nodes: &[Node],
    pods_by_node: &HashMap<String, Vec<Pod>>,
) -> Result<(), SafetyBlock> {
    for pod in candidate_pods {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let mut feasible = false;
        let mut last_reason = String::new();

        for node in other_nodes {
            let node_name = node.metadata.name.clone().unwrap_or_default();

            if !node_selector_satisfied(pod, node) {
                last_reason = "node-selector/node-affinity".to_string();
                continue;
            }
            if !tolerations_cover_taints(pod, node) {
                last_reason = "taint toleration".to_string();
                continue;
            }
            let resident = pods_by_node.get(&node_name).map(|v| v.as_slice()).unwrap_or(&[]);
            if violates_anti_affinity(pod, resident) {
                last_reason = "pod anti-affinity".to_string();
                continue;
            }
            feasible = true;
            break;
        }

        if !feasible {
            return Err(SafetyBlock::new(
                BlockReason::Affinity,
                format!("pod {pod_name} has no feasible remaining node (failing constraint family: {last_reason})"),
            ));
        }
    }
    Ok(())
}

fn required_anti_affinity_terms(
    pod: &Pod,
) -> Option<&Vec<k8s_openapi::api::core::v1::PodAffinityTerm>> {
    pod.spec
        .as_ref()?
        .affinity
        .as_ref()?
        .pod_anti_affinity
        .as_ref()?
        .required_during_scheduling_ignored_during_execution
        .as_ref()
}

fn labels_match(selector: &LabelSelector, pod: &Pod) -> bool {
    let empty = BTreeMap::new();
    let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
    label_selector::matches(selector, labels)
}

fn node_selector_satisfied(pod: &Pod, node: &Node) -> bool {
    let empty_labels = BTreeMap::new();
    let node_labels = node.metadata.labels.as_ref().unwrap_or(&empty_labels);

    let Some(spec) = &pod.spec else { return true };

    if let Some(node_selector) = &spec.node_selector {
        for (k, v) in node_selector {
            if node_labels.get(k) != Some(v) {
                return false;
            }
        }
    }

    let Some(affinity) = &spec.affinity else { return true };
    let Some(node_affinity) = &affinity.node_affinity else { return true };
    let Some(required) = &node_affinity.required_during_scheduling_ignored_during_execution else {
        return true;
    };
    if required.node_selector_terms.is_empty() {
        return true;
    }
    required.node_selector_terms.iter().any(|term| {
        term.match_expressions
            .as_ref()
            .map(|exprs| exprs.iter().all(|e| node_selector_requirement_matches(e, node_labels)))
            .unwrap_or(true)
    })
}

fn node_selector_requirement_matches(
    expr: &k8s_openapi::api::core::v1::NodeSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> bool {
    let values = expr.values.as_deref().unwrap_or(&[]);
    match expr.operator.as_str() {
        "In" => labels.get(&expr.key).map(|v| values.contains(v)).unwrap_or(false),
        "NotIn" => labels.get(&expr.key).map(|v| !values.contains(v)).unwrap_or(true),
        "Exists" => labels.contains_key(&expr.key),
        "DoesNotExist" => !labels.contains_key(&expr.key),
        _ => false,
    }
}

fn tolerations_cover_taints(pod: &Pod, node: &Node) -> bool {
    let empty: Vec<Taint> = Vec::new();
    let taints = node.spec.as_ref().and_then(|s| s.taints.as_ref()).unwrap_or(&empty);
    let empty_tol: Vec<Toleration> = Vec::new();
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.as_ref())
        .unwrap_or(&empty_tol);

    taints.iter().all(|taint| {
        let blocking = matches!(taint.effect.as_str(), "NoSchedule" | "NoExecute");
        if !blocking {
            return true;
        }
        tolerations.iter().any(|tol| tolerates(tol, taint))
    })
}

fn tolerates(tol: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = &tol.effect {
        if effect != &taint.effect {
            return false;
        }
    }
    match &tol.key {
        None => tol.operator.as_deref() == Some("Exists"),
        Some(key) if key == &taint.key => match tol.operator.as_deref() {
            Some("Exists") | None => true,
            Some("Equal") => tol.value.as_deref() == taint.value.as_deref(),
            _ => false,
        },
        _ => false,
    }
}

fn violates_anti_affinity(pod: &Pod, resident_pods: &[Pod]) -> bool {
    let Some(terms) = required_anti_affinity_terms(pod) else {
        return false;
    };
    for term in terms {
        if term.topology_key != HOSTNAME_TOPOLOGY_KEY {
            continue;
        }
        let Some(selector) = &term.label_selector else {
            continue;
        };
        if resident_pods.iter().any(|r| labels_match(selector, r)) {
            return true;
        }
    }
    false
}
