//! Shapes shared across components (spec.md §3): the node-group contract
//! consumed from the external reconciler, and the transient/process-lifetime
//! state owned by this engine.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::BlockReason;
use crate::store::NodeUtilization;

/// `protected=true` or `scale-down-disabled=true`, as an annotation or a
/// label (spec.md §3). Shared by the orchestrator's candidate prefilter and
/// the safety verifier's final protected-node gate so the two never drift.
pub fn node_is_protected(node: &Node) -> bool {
    let flagged = |map: Option<&std::collections::BTreeMap<String, String>>, key: &str| {
        map.and_then(|m| m.get(key)).map(|v| v == "true").unwrap_or(false)
    };
    let annotations = node.metadata.annotations.as_ref();
    let labels = node.metadata.labels.as_ref();
    flagged(annotations, "protected")
        || flagged(labels, "protected")
        || flagged(annotations, "scale-down-disabled")
        || flagged(labels, "scale-down-disabled")
}

/// `creation-reason=metrics` (spec.md §3, §4.7 step 2): only nodes created
/// by the metrics-driven path are eligible for scale-down.
pub fn node_is_metrics_created(node: &Node) -> bool {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get("creation-reason"))
        .map(|v| v == "metrics")
        .unwrap_or(false)
}

/// `Succeeded`/`Failed` pods are terminal and excluded from every safety and
/// drain consideration (spec.md §4.4 step 1, §4.6 step 2).
pub fn is_terminal_pod(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Loads a list of node groups from a YAML file (spec.md §1: the node-group
/// reconciler is an external collaborator; standalone runs read its output
/// from disk in the same shape `EngineConfig::from_yaml_file` reads config).
pub fn load_node_groups_file(path: &str) -> anyhow::Result<Vec<NodeGroup>> {
    let contents = std::fs::read_to_string(path)?;
    let groups: Vec<NodeGroup> = serde_yaml::from_str(&contents)?;
    Ok(groups)
}

/// A node group as consumed from the external reconciler (spec.md §3). Only
/// the fields this engine reads are modeled; CRD schema ownership stays out
/// of scope per spec.md §1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    pub name: String,
    pub namespace: String,
    pub min_nodes: i32,
    pub max_nodes: i32,
    pub scale_down_enabled: bool,
    /// Whether the group carries the autoscaler's managed label. Unmanaged
    /// groups are skipped outright (spec.md §3, §4.7 step 1).
    pub managed: bool,
    pub node_names: Vec<String>,
}

/// Transient, one-reconcile-cycle record (spec.md §3). Carries a detached
/// deep copy of the node's utilization — see [`crate::store::UtilizationStore::snapshot`]
/// for the copy-on-read guarantee this relies on.
#[derive(Debug, Clone)]
pub struct ScaleDownCandidate {
    pub node_name: String,
    pub node: Node,
    pub utilization: NodeUtilization,
    pub pods: Vec<Pod>,
    pub priority: i64,
    pub outcome: Option<CandidateOutcome>,
}

/// Per-candidate verification outcome, recorded alongside the candidate for
/// audit/reporting even when a drain never starts.
#[derive(Debug, Clone)]
pub enum CandidateOutcome {
    Blocked(BlockReason, String),
    DrainStarted,
}

/// Process-lifetime state (spec.md §3): last successful drain time per
/// group, guarded by its own reader-writer lock independent of the
/// utilization store's (spec.md §5).
#[derive(Debug, Default)]
pub struct ScaleDownState {
    last_scale_down_time: std::sync::RwLock<HashMap<String, DateTime<Utc>>>,
}

impl ScaleDownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the last successful drain time for a group, if any.
    pub fn last_scale_down_time(&self, group: &str) -> Option<DateTime<Utc>> {
        self.last_scale_down_time
            .read()
            .expect("ScaleDownState lock poisoned")
            .get(group)
            .copied()
    }

    /// Records `now` as the last successful drain time for a group. Called
    /// once per reconcile, atomically with the first successful drain
    /// (spec.md §5's cooldown contract).
    pub fn record_scale_down(&self, group: &str, now: DateTime<Utc>) {
        self.last_scale_down_time
            .write()
            .expect("ScaleDownState lock poisoned")
            .insert(group.to_string(), now);
    }

    /// True when `now >= last_scale_down_time[group] + cooldown`, or no
    /// prior drain is recorded.
    pub fn cooldown_elapsed(&self, group: &str, cooldown: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.last_scale_down_time(group) {
            Some(last) => now >= last + cooldown,
            None => true,
        }
    }
}
