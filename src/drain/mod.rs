//! Drainer (C6, spec.md §4.6): the state machine that cordons a node,
//! evicts its drainable pods with retries, waits for termination, and rolls
//! back only for failures that occur before eviction begins. The eviction
//! phase runs detached from the caller's cancellation so a controller
//! shutdown never strands a half-evicted node (spec.md §9).
//!
//! Every `ClusterClient` call here already runs to its own completion
//! independent of the caller-supplied [`CancellationToken`] — the trait has
//! no cancellation parameter — which is what gives rollback and finalize
//! calls their "fresh context" property without an explicit second client.

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::domain::is_terminal_pod;
use crate::error::EngineError;
use crate::k8s::{ClusterClient, EvictOutcome};

/// Outcome of one drain attempt (spec.md §4.6, §7). Every variant except
/// [`DrainOutcome::FailedBeforeEviction`] leaves the node cordoned.
#[derive(Debug, Clone)]
pub enum DrainOutcome {
    /// Eviction and termination completed; no drainable pods remain.
    Success { pods_evicted: usize, detached: bool },
    /// Cordon, pod listing, or the PDB check failed; the node was
    /// uncordoned (rollback).
    FailedBeforeEviction { reason: String },
    /// Eviction was throttled (HTTP 429) mid-drain; aborted without
    /// rollback.
    EvictionThrottled { pods_evicted: usize, detached: bool },
    /// Termination did not complete within the drain timeout.
    Timeout { pods_evicted: usize, detached: bool },
    /// Termination wait completed but a post-verification re-scan still
    /// found drainable pods on the node.
    Incomplete { remaining_pods: usize, pods_evicted: usize, detached: bool },
}

impl DrainOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DrainOutcome::Success { .. })
    }
}

pub struct Drainer<C: ClusterClient> {
    cluster: Arc<C>,
    drain_timeout: Duration,
    eviction_grace_period_secs: u32,
    eviction_max_retries: u32,
    eviction_retry_interval: Duration,
    termination_poll_interval: Duration,
    enable_pdb_validation: bool,
}

impl<C: ClusterClient + 'static> Drainer<C> {
    pub fn new(cluster: Arc<C>, config: &EngineConfig) -> Self {
        Self {
            cluster,
            drain_timeout: config.drain_timeout(),
            eviction_grace_period_secs: config.eviction_grace_period_secs,
            eviction_max_retries: config.eviction_max_retries,
            eviction_retry_interval: Duration::from_secs(config.eviction_retry_interval_secs),
            termination_poll_interval: Duration::from_secs(config.termination_poll_interval_secs),
            enable_pdb_validation: config.enable_pdb_validation,
        }
    }

    /// Runs the full state machine (spec.md §4.6 steps 1-8) against `node_name`.
    /// `caller_token` governs cancellation up to (but not through) eviction.
    pub async fn drain_node(&self, node_name: &str, caller_token: CancellationToken) -> Result<DrainOutcome, EngineError> {
        self.cluster
            .cordon(node_name)
            .await
            .map_err(|e| EngineError::transient(format!("drain {node_name}: cordon failed: {e}")))?;

        let all_pods = self
            .cluster
            .list_pods_on_node(node_name)
            .await
            .map_err(|e| EngineError::transient(format!("drain {node_name}: list_pods_on_node failed: {e}")))?;
        let filtered = filter_drainable_pods(&all_pods);

        if filtered.is_empty() {
            info!("drain {node_name}: no drainable pods, node stays cordoned");
            return Ok(DrainOutcome::Success { pods_evicted: 0, detached: false });
        }

        if self.enable_pdb_validation {
            if let Err(block) = crate::pdb::validate(&filtered, self.cluster.as_ref()).await {
                warn!("drain {node_name}: PDB check blocked, rolling back: {block}");
                self.rollback(node_name).await;
                return Ok(DrainOutcome::FailedBeforeEviction { reason: block.to_string() });
            }
        }

        self.annotate(node_name, "draining", Some(Utc::now())).await?;

        let (stage, detached) = self.run_eviction_phase(node_name, filtered, caller_token).await?;

        if stage.throttled {
            return Ok(DrainOutcome::EvictionThrottled { pods_evicted: stage.pods_evicted, detached });
        }
        if !stage.terminated {
            return Ok(DrainOutcome::Timeout { pods_evicted: stage.pods_evicted, detached });
        }

        let remaining = self
            .cluster
            .list_pods_on_node(node_name)
            .await
            .map(|pods| filter_drainable_pods(&pods).len())
            .unwrap_or(usize::MAX);
        if remaining > 0 {
            return Ok(DrainOutcome::Incomplete {
                remaining_pods: remaining,
                pods_evicted: stage.pods_evicted,
                detached,
            });
        }

        self.annotate(node_name, "complete", None).await?;
        Ok(DrainOutcome::Success { pods_evicted: stage.pods_evicted, detached })
    }

    /// Spawns the eviction+termination-wait work on its own deadline-bounded
    /// future (spec.md §4.6 step 5, §9's detached-work note) and races it
    /// against the caller's cancellation. If the caller cancels first, the
    /// work continues unobserved until its own deadline.
    async fn run_eviction_phase(
        &self,
        node_name: &str,
        pods: Vec<Pod>,
        caller_token: CancellationToken,
    ) -> Result<(StageResult, bool), EngineError> {
        let cluster = Arc::clone(&self.cluster);
        let node_name_owned = node_name.to_string();
        let grace = self.eviction_grace_period_secs;
        let max_retries = self.eviction_max_retries;
        let retry_interval = self.eviction_retry_interval;
        let poll_interval = self.termination_poll_interval;
        let budget = self.drain_timeout;

        let mut task = tokio::spawn(async move {
            evict_and_wait(cluster, node_name_owned, pods, grace, max_retries, retry_interval, poll_interval, budget).await
        });

        let mut detached = false;
        let result = tokio::select! {
            biased;
            res = &mut task => res,
            _ = caller_token.cancelled() => {
                warn!("drain {node_name}: caller cancelled during eviction, detaching until deadline");
                detached = true;
                (&mut task).await
            }
        };

        let stage = result.map_err(|e| EngineError::Fatal(format!("drain {node_name}: eviction task panicked: {e}")))?;
        Ok((stage, detached))
    }

    /// Rollback (spec.md §4.6 step 3, §9): uncordon on a fresh call,
    /// independent of the caller's cancellation, before any eviction begins.
    async fn rollback(&self, node_name: &str) {
        if let Err(e) = self.cluster.uncordon(node_name).await {
            warn!("drain {node_name}: rollback uncordon failed: {e}");
        }
    }

    async fn annotate(&self, node_name: &str, status: &str, start_time: Option<chrono::DateTime<Utc>>) -> Result<(), EngineError> {
        let mut annotations = HashMap::new();
        annotations.insert("drain-status".to_string(), status.to_string());
        if let Some(t) = start_time {
            annotations.insert("drain-start-time".to_string(), t.to_rfc3339());
        }
        self.cluster
            .annotate_node(node_name, annotations)
            .await
            .map_err(|e| EngineError::transient(format!("drain {node_name}: annotate({status}) failed: {e}")))
    }
}

struct StageResult {
    pods_evicted: usize,
    throttled: bool,
    terminated: bool,
}

async fn evict_and_wait<C: ClusterClient>(
    cluster: Arc<C>,
    node_name: String,
    pods: Vec<Pod>,
    grace: u32,
    max_retries: u32,
    retry_interval: Duration,
    poll_interval: Duration,
    budget: Duration,
) -> StageResult {
    let deadline = Instant::now() + budget;
    let eviction = evict_pods(cluster.as_ref(), &node_name, &pods, grace, max_retries, retry_interval).await;

    if eviction.throttled {
        return StageResult {
            pods_evicted: eviction.evicted_uids.len(),
            throttled: true,
            terminated: false,
        };
    }

    let terminated = wait_for_termination(cluster.as_ref(), &node_name, &eviction.evicted_uids, poll_interval, deadline).await;
    StageResult {
        pods_evicted: eviction.evicted_uids.len(),
        throttled: false,
        terminated,
    }
}

struct EvictionResult {
    evicted_uids: Vec<String>,
    throttled: bool,
}

/// Eviction loop (spec.md §4.6 step 5): 404 counts as success, 429 aborts
/// the whole phase immediately, any other error retries up to `max_retries`
/// times at `retry_interval`.
async fn evict_pods<C: ClusterClient>(
    cluster: &C,
    node_name: &str,
    pods: &[Pod],
    grace: u32,
    max_retries: u32,
    retry_interval: Duration,
) -> EvictionResult {
    let mut evicted_uids = Vec::new();
    for pod in pods {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let uid = pod.metadata.uid.clone();
        let mut attempt = 0u32;
        loop {
            match cluster.evict_pod(&namespace, &name, grace).await {
                EvictOutcome::Success | EvictOutcome::NotFound => {
                    if let Some(u) = uid {
                        evicted_uids.push(u);
                    }
                    break;
                }
                EvictOutcome::TooManyRequests => {
                    warn!("drain {node_name}: eviction of {namespace}/{name} throttled (429), aborting");
                    return EvictionResult { evicted_uids, throttled: true };
                }
                EvictOutcome::Other(msg) => {
                    attempt += 1;
                    if attempt > max_retries {
                        warn!("drain {node_name}: eviction of {namespace}/{name} gave up after {max_retries} retries: {msg}");
                        break;
                    }
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }
    EvictionResult { evicted_uids, throttled: false }
}

/// Termination wait (spec.md §4.6 step 6): poll until none of the evicted
/// UIDs are still present on the node, or the deadline passes.
async fn wait_for_termination<C: ClusterClient>(
    cluster: &C,
    node_name: &str,
    evicted_uids: &[String],
    poll_interval: Duration,
    deadline: Instant,
) -> bool {
    if evicted_uids.is_empty() {
        return true;
    }
    loop {
        match cluster.list_pods_on_node(node_name).await {
            Ok(pods) => {
                let still_present = pods
                    .iter()
                    .any(|p| p.metadata.uid.as_ref().map(|u| evicted_uids.contains(u)).unwrap_or(false));
                if !still_present {
                    return true;
                }
            }
            Err(e) => warn!("drain {node_name}: termination poll failed, retrying: {e}"),
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Filters out DaemonSet-owned pods, mirror/static pods, and terminal pods
/// (spec.md §4.6 step 2).
fn filter_drainable_pods(pods: &[Pod]) -> Vec<Pod> {
    pods.iter()
        .filter(|p| !is_terminal_pod(p))
        .filter(|p| !is_daemonset_owned(p))
        .filter(|p| !is_mirror_or_static_pod(p))
        .cloned()
        .collect()
}

fn is_daemonset_owned(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
        .unwrap_or(false)
}

fn is_mirror_or_static_pod(pod: &Pod) -> bool {
    let has_mirror_annotation = pod
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key("kubernetes.io/config.mirror") || a.contains_key("kubernetes.io/config.source"))
        .unwrap_or(false);
    let has_node_owner = pod
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.kind == "Node"))
        .unwrap_or(false);
    has_mirror_annotation || has_node_owner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::MockClusterClient;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, ObjectMeta};

    fn plain_pod(name: &str, uid: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: None,
        }
    }

    fn daemonset_pod(name: &str) -> Pod {
        let mut pod = plain_pod(name, "ds-uid");
        pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "DaemonSet".to_string(),
            name: "ds".to_string(),
            uid: "ds-owner".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);
        pod
    }

    #[test]
    fn filters_out_daemonset_pods() {
        let pods = vec![plain_pod("app-1", "u1"), daemonset_pod("ds-1")];
        let filtered = filter_drainable_pods(&pods);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].metadata.name.as_deref(), Some("app-1"));
    }

    #[test]
    fn filters_out_mirror_pods_by_annotation() {
        let mut pod = plain_pod("mirror-1", "u2");
        pod.metadata.annotations = Some(std::collections::BTreeMap::from([(
            "kubernetes.io/config.mirror".to_string(),
            "hash".to_string(),
        )]));
        let filtered = filter_drainable_pods(&[pod]);
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn empty_drainable_set_succeeds_without_eviction() {
        let mut mock = MockClusterClient::new();
        mock.expect_cordon().returning(|_| Ok(()));
        mock.expect_list_pods_on_node().returning(|_| Ok(vec![daemonset_pod("ds-1")]));
        let drainer = Drainer::new(Arc::new(mock), &EngineConfig::default());
        let outcome = drainer.drain_node("node-a", CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DrainOutcome::Success { pods_evicted: 0, detached: false }));
    }

    #[tokio::test]
    async fn cordon_failure_aborts_with_no_side_effects() {
        let mut mock = MockClusterClient::new();
        mock.expect_cordon().returning(|_| Err(EngineError::transient("boom")));
        let drainer = Drainer::new(Arc::new(mock), &EngineConfig::default());
        let result = drainer.drain_node("node-a", CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn successful_drain_evicts_and_finalizes() {
        let mut mock = MockClusterClient::new();
        mock.expect_cordon().returning(|_| Ok(()));
        mock.expect_list_pods_on_node()
            .times(1)
            .returning(|_| Ok(vec![plain_pod("app-1", "u1")]));
        mock.expect_list_pdbs().returning(|_| Ok(vec![]));
        mock.expect_annotate_node().returning(|_, _| Ok(()));
        mock.expect_evict_pod().returning(|_, _, _| EvictOutcome::Success);
        mock.expect_list_pods_on_node().returning(|_| Ok(vec![]));
        let drainer = Drainer::new(Arc::new(mock), &EngineConfig::default());
        let outcome = drainer.drain_node("node-a", CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, DrainOutcome::Success { pods_evicted: 1, detached: false }));
    }
}
