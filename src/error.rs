//! Typed error taxonomy for the scale-down engine.
//!
//! Blocks (the node is fine, removal is merely not permitted right now) are
//! modeled as [`BlockReason`], not as errors: per the disruption rules the
//! orchestrator must keep evaluating the next candidate on a block. Genuine
//! faults use [`EngineError`] and propagate with `?` the way the rest of the
//! codebase does.

use thiserror::Error;

/// Why a node was not scaled down. Not an error — a decision, reported with
/// a metric increment and continued evaluation of the next candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Cooldown,
    MinNodes,
    LocalStorage,
    Capacity,
    Affinity,
    ProtectedNode,
    Pdb,
    PolicyConstraint,
    SafetyCheck,
}

impl BlockReason {
    /// Label value used in `scale_down_blocked_total{reason=...}`.
    pub fn as_label(&self) -> &'static str {
        match self {
            BlockReason::Cooldown => "cooldown",
            BlockReason::MinNodes => "min_nodes",
            BlockReason::LocalStorage => "local_storage",
            BlockReason::Capacity => "capacity",
            BlockReason::Affinity => "affinity",
            BlockReason::ProtectedNode => "protected_node",
            BlockReason::Pdb => "pdb",
            BlockReason::PolicyConstraint => "policy_constraint",
            BlockReason::SafetyCheck => "safety_check",
        }
    }
}

/// A safety-pipeline block carries the reason plus a human-readable detail
/// naming the offending resource (pod, PDB, node) for logs and audit trails.
#[derive(Debug, Clone)]
pub struct SafetyBlock {
    pub reason: BlockReason,
    pub detail: String,
}

impl SafetyBlock {
    pub fn new(reason: BlockReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for SafetyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason.as_label(), self.detail)
    }
}

/// Fault taxonomy for the engine's internal operations (spec.md §7). These
/// are genuine failures, not removal decisions.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("blocked by safety check ({family}): {detail}")]
    BlockedBySafety { family: BlockReason, detail: String },

    #[error("blocked by policy: {0}")]
    BlockedByPolicy(String),

    #[error("blocked by PodDisruptionBudget {namespace}/{name}: no disruptions allowed")]
    BlockedByPdb { namespace: String, name: String },

    #[error("blocked by cooldown: {remaining_secs}s remaining")]
    BlockedByCooldown { remaining_secs: i64 },

    #[error("blocked by min_nodes floor: group has {current} nodes, floor is {min_nodes}")]
    BlockedByMinNodes { current: usize, min_nodes: i32 },

    #[error("transient cluster error: {0}")]
    TransientClusterError(String),

    #[error("drain timed out after {elapsed_secs}s")]
    DrainTimeout { elapsed_secs: u64 },

    #[error("drain incomplete: {remaining_pods} pod(s) remain on node {node}")]
    DrainIncomplete { node: String, remaining_pods: usize },

    #[error("drain detached: caller cancelled, eviction continued under its own deadline")]
    DrainDetached,

    #[error("eviction forbidden (429 PDB throttled) for pod {namespace}/{name}")]
    EvictionForbidden { namespace: String, name: String },

    #[error("programmer error: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn transient(msg: impl Into<String>) -> Self {
        EngineError::TransientClusterError(msg.into())
    }
}
