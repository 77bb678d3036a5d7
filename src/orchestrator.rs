//! Scale-Down Orchestrator (C7, spec.md §4.7): per node-group reconcile,
//! selects candidates from the Utilization Store, gates each through the
//! Policy Engine and Safety Verifier, drains the ones that pass, and records
//! the cooldown timestamp on the first success.

use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::domain::{node_is_metrics_created, node_is_protected, CandidateOutcome, NodeGroup, ScaleDownCandidate, ScaleDownState};
use crate::drain::{DrainOutcome, Drainer};
use crate::error::{BlockReason, EngineError};
use crate::k8s::ClusterClient;
use crate::observability::MetricsRecorder;
use crate::policy::PolicyEngine;
use crate::safety::SafetyVerifier;
use crate::store::{NodeUtilization, UtilizationStore};

/// Fraction of in-window samples that must be underutilized for "sustained"
/// (spec.md §4.7).
const SUSTAINED_RATIO: f64 = 0.8;

/// Per-reconcile outcome summary, returned for logging/testing.
#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub drains_succeeded: usize,
    pub blocked: Vec<(String, BlockReason)>,
    pub errored: Vec<(String, String)>,
}

pub struct ScaleDownOrchestrator<C: ClusterClient + 'static> {
    cluster: Arc<C>,
    store: Arc<UtilizationStore>,
    state: Arc<ScaleDownState>,
    policy: Arc<PolicyEngine>,
    safety: SafetyVerifier<C>,
    drainer: Drainer<C>,
    metrics: Arc<MetricsRecorder>,
    config: EngineConfig,
}

impl<C: ClusterClient + 'static> ScaleDownOrchestrator<C> {
    pub fn new(
        cluster: Arc<C>,
        store: Arc<UtilizationStore>,
        state: Arc<ScaleDownState>,
        policy: Arc<PolicyEngine>,
        metrics: Arc<MetricsRecorder>,
        config: EngineConfig,
    ) -> Self {
        let safety = SafetyVerifier::new(Arc::clone(&cluster), &config);
        let drainer = Drainer::new(Arc::clone(&cluster), &config);
        Self {
            cluster,
            store,
            state,
            policy,
            safety,
            drainer,
            metrics,
            config,
        }
    }

    /// One reconcile of `group` (spec.md §4.7 steps 1-7).
    pub async fn reconcile(&self, group: &NodeGroup) -> Result<ReconcileReport, EngineError> {
        let mut report = ReconcileReport::default();

        if !group.managed {
            info!("orchestrator: group {} is not managed, skipping", group.name);
            return Ok(report);
        }

        let mut candidates = self.identify_candidates(group).await?;
        let max_concurrent = self.policy.get_max_concurrent();
        if candidates.len() > max_concurrent {
            candidates.truncate(max_concurrent);
        }

        let mut live_count = group.node_names.len();
        let mut any_success = false;

        for mut candidate in candidates {
            let decision = self.can_scale_down(group, &candidate, live_count).await;
            match decision {
                Err(reason) => {
                    self.metrics.record_blocked(&group.name, &group.namespace, reason);
                    candidate.outcome = Some(CandidateOutcome::Blocked(reason, reason.as_label().to_string()));
                    report.blocked.push((candidate.node_name.clone(), reason));
                    continue;
                }
                Ok(()) => {}
            }

            let started = Instant::now();
            let outcome = self
                .drainer
                .drain_node(&candidate.node_name, CancellationToken::new())
                .await;

            match outcome {
                Ok(DrainOutcome::Success { pods_evicted, detached }) => {
                    self.metrics.record_drain_duration(&group.name, &group.namespace, "success", started.elapsed());
                    self.metrics.record_pods_evicted(&group.name, &group.namespace, pods_evicted as u64);
                    self.metrics.record_scale_down(&group.name, &group.namespace);
                    self.metrics.record_nodes_removed(&group.name, &group.namespace, 1);
                    info!(
                        "orchestrator: drained {} ({} pod(s) evicted, detached={detached})",
                        candidate.node_name, pods_evicted
                    );
                    candidate.outcome = Some(CandidateOutcome::DrainStarted);
                    any_success = true;
                    live_count = live_count.saturating_sub(1);
                    report.drains_succeeded += 1;
                }
                Ok(DrainOutcome::FailedBeforeEviction { reason }) => {
                    warn!("orchestrator: drain of {} blocked before eviction: {reason}", candidate.node_name);
                    self.metrics.record_blocked(&group.name, &group.namespace, BlockReason::Pdb);
                    report.blocked.push((candidate.node_name.clone(), BlockReason::Pdb));
                }
                Ok(DrainOutcome::EvictionThrottled { pods_evicted, .. }) => {
                    self.metrics.record_drain_duration(&group.name, &group.namespace, "error", started.elapsed());
                    self.metrics.record_pods_evicted(&group.name, &group.namespace, pods_evicted as u64);
                    self.metrics.record_error(&group.name, &group.namespace, "eviction_throttled");
                    report.errored.push((candidate.node_name.clone(), "eviction_throttled".to_string()));
                }
                Ok(DrainOutcome::Timeout { pods_evicted, .. }) => {
                    self.metrics.record_drain_duration(&group.name, &group.namespace, "timeout", started.elapsed());
                    self.metrics.record_pods_evicted(&group.name, &group.namespace, pods_evicted as u64);
                    self.metrics.record_error(&group.name, &group.namespace, "drain_timeout");
                    report.errored.push((candidate.node_name.clone(), "drain_timeout".to_string()));
                }
                Ok(DrainOutcome::Incomplete { remaining_pods, pods_evicted, .. }) => {
                    self.metrics.record_drain_duration(&group.name, &group.namespace, "error", started.elapsed());
                    self.metrics.record_pods_evicted(&group.name, &group.namespace, pods_evicted as u64);
                    self.metrics.record_error(&group.name, &group.namespace, "drain_incomplete");
                    report
                        .errored
                        .push((candidate.node_name.clone(), format!("drain_incomplete({remaining_pods} remaining)")));
                }
                Err(e) => {
                    self.metrics.record_error(&group.name, &group.namespace, "drain_fault");
                    report.errored.push((candidate.node_name.clone(), e.to_string()));
                }
            }
        }

        if any_success {
            self.state.record_scale_down(&group.name, Utc::now());
        }

        Ok(report)
    }

    async fn identify_candidates(&self, group: &NodeGroup) -> Result<Vec<ScaleDownCandidate>, EngineError> {
        let nodes = self.cluster.list_nodes_in_group(&group.name).await?;
        let thresholds = self.policy.get_thresholds();
        let now = Utc::now();
        let window = chrono::Duration::seconds(thresholds.observation_window_secs as i64);

        let mut candidates = Vec::new();
        for node in nodes {
            let Some(name) = node.metadata.name.clone() else { continue };
            if node_is_protected(&node) {
                continue;
            }
            if !node_is_metrics_created(&node) {
                continue;
            }
            let Some(snapshot) = self.store.snapshot(&name) else { continue };
            if !snapshot.is_underutilized {
                continue;
            }
            if !is_sustained_underutilized(
                &snapshot,
                window,
                thresholds.cpu_threshold,
                thresholds.memory_threshold,
                self.config.staleness_ceiling_secs,
                now,
            ) {
                continue;
            }

            let pods = match self.cluster.list_pods_on_node(&name).await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!("orchestrator: failed to list pods on node {name}, skipping candidate this cycle: {e}");
                    continue;
                }
            };
            let priority = compute_priority(&snapshot, &pods);
            candidates.push(ScaleDownCandidate {
                node_name: name,
                node,
                utilization: snapshot,
                pods,
                priority,
                outcome: None,
            });
        }

        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.node_name.cmp(&b.node_name)));
        Ok(candidates)
    }

    /// `CanScaleDown` (spec.md §4.7 step 5): cooldown, min_nodes floor,
    /// safety pipeline, then policy — first block wins.
    async fn can_scale_down(&self, group: &NodeGroup, candidate: &ScaleDownCandidate, live_count: usize) -> Result<(), BlockReason> {
        let now = Utc::now();
        let cooldown = chrono::Duration::seconds(self.config.cooldown_secs as i64);
        if !self.state.cooldown_elapsed(&group.name, cooldown, now) {
            return Err(BlockReason::Cooldown);
        }
        if live_count <= group.min_nodes.max(0) as usize {
            return Err(BlockReason::MinNodes);
        }
        if let Err(block) = self.safety.verify(&candidate.node, &candidate.pods).await {
            self.metrics.record_safety_check_failure(block.reason.as_label(), &group.name, &group.namespace);
            return Err(block.reason);
        }
        let annotations: std::collections::HashMap<String, String> = candidate
            .node
            .metadata
            .annotations
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        self.policy
            .allow_scale_down_at(group.scale_down_enabled, &annotations, now)?;
        Ok(())
    }
}

/// Sustained-underutilization test (spec.md §4.7): at least one in-window
/// sample, ≥80% of them under both thresholds, and fresh data.
fn is_sustained_underutilized(
    nu: &NodeUtilization,
    window: chrono::Duration,
    cpu_threshold: f64,
    memory_threshold: f64,
    staleness_ceiling_secs: u64,
    now: chrono::DateTime<Utc>,
) -> bool {
    if now - nu.last_updated > chrono::Duration::seconds(staleness_ceiling_secs as i64) {
        return false;
    }
    let in_window = nu.samples_in_window(window, now);
    if in_window.is_empty() {
        return false;
    }
    let underutilized_count = in_window
        .iter()
        .filter(|s| s.cpu_percent < cpu_threshold && s.memory_percent < memory_threshold)
        .count();
    (underutilized_count as f64 / in_window.len() as f64) >= SUSTAINED_RATIO
}

/// Priority formula (spec.md §4.7 step 3): lower runs first.
fn compute_priority(nu: &NodeUtilization, pods: &[k8s_openapi::api::core::v1::Pod]) -> i64 {
    let avg_util = (nu.cpu_utilization + nu.memory_utilization) / 2.0;
    let pod_count = pods.len() as i64;
    let kube_system_count = pods
        .iter()
        .filter(|p| p.metadata.namespace.as_deref() == Some("kube-system"))
        .count() as i64;
    (avg_util * 10.0).round() as i64 + 100 * pod_count + 500 * kube_system_count
}
