//! Cluster client contract (spec.md §6). The engine only ever talks to
//! Kubernetes through the narrow [`ClusterClient`] interface so the
//! safety/PDB/drain/orchestrator logic stays testable against a mock
//! (`mockall::automock`) instead of a live API server — spec.md §1
//! explicitly scopes the Kubernetes API client as an external collaborator
//! "consumed as an interface".

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use std::collections::HashMap;

use crate::error::EngineError;

/// Distinguishable outcomes for an eviction request (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictOutcome {
    Success,
    NotFound,
    TooManyRequests,
    Other(String),
}

/// Narrow cluster-API surface the engine consumes (spec.md §6). A real
/// implementation ([`KubeClusterClient`]) wraps `kube::Client`; tests use
/// `MockClusterClient` generated by `mockall::automock`.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, EngineError>;
    async fn get_node(&self, name: &str) -> Result<Node, EngineError>;
    async fn list_nodes_in_group(&self, group_label_value: &str) -> Result<Vec<Node>, EngineError>;
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, EngineError>;
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>, EngineError>;
    async fn list_ready_schedulable_nodes(&self, exclude: &str) -> Result<Vec<Node>, EngineError>;

    /// Marks a node unschedulable. Idempotent if already cordoned.
    async fn cordon(&self, node_name: &str) -> Result<(), EngineError>;
    /// Marks a node schedulable. Idempotent if already schedulable.
    async fn uncordon(&self, node_name: &str) -> Result<(), EngineError>;
    /// Merge-patches the given annotations onto a node (audit trail fields:
    /// `drain-start-time`, `drain-status`).
    async fn annotate_node(&self, node_name: &str, annotations: HashMap<String, String>) -> Result<(), EngineError>;

    async fn list_pdbs(&self, namespace: &str) -> Result<Vec<PodDisruptionBudget>, EngineError>;
    async fn evict_pod(&self, namespace: &str, name: &str, grace_period_seconds: u32) -> EvictOutcome;

    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>, EngineError>;
    async fn get_pv(&self, name: &str) -> Result<PersistentVolume, EngineError>;
}

fn to_engine_error(context: &str, err: kube::Error) -> EngineError {
    EngineError::transient(format!("{context}: {err}"))
}

/// `kube`-backed implementation of the narrow [`ClusterClient`] surface this
/// engine needs.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    /// Label key marking a node as belonging to a managed group (e.g.
    /// `vpsie.com/node-group`); used by `list_nodes_in_group`.
    group_label_key: String,
}

impl KubeClusterClient {
    pub async fn new(config_file: Option<&str>, group_label_key: impl Into<String>) -> anyhow::Result<Self> {
        if let Some(path) = config_file {
            std::env::set_var("KUBECONFIG", path);
        }
        let config = kube::Config::infer().await?;
        let client = Client::try_from(config)?;
        Ok(Self {
            client,
            group_label_key: group_label_key.into(),
        })
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn pdbs(&self, namespace: &str) -> Api<PodDisruptionBudget> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvs(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }
}

fn is_ready_schedulable(node: &Node) -> bool {
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    if unschedulable {
        return false;
    }
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_nodes(&self) -> Result<Vec<Node>, EngineError> {
        self.nodes()
            .list(&ListParams::default())
            .await
            .map(|l| l.items)
            .map_err(|e| to_engine_error("list_nodes", e))
    }

    async fn get_node(&self, name: &str) -> Result<Node, EngineError> {
        self.nodes()
            .get(name)
            .await
            .map_err(|e| to_engine_error("get_node", e))
    }

    async fn list_nodes_in_group(&self, group_label_value: &str) -> Result<Vec<Node>, EngineError> {
        let selector = format!("{}={}", self.group_label_key, group_label_value);
        self.nodes()
            .list(&ListParams::default().labels(&selector))
            .await
            .map(|l| l.items)
            .map_err(|e| to_engine_error("list_nodes_in_group", e))
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, EngineError> {
        let field_selector = format!("spec.nodeName={node_name}");
        self.pods(None)
            .list(&ListParams::default().fields(&field_selector))
            .await
            .map(|l| l.items)
            .map_err(|e| to_engine_error("list_pods_on_node", e))
    }

    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>, EngineError> {
        self.pods(namespace)
            .list(&ListParams::default())
            .await
            .map(|l| l.items)
            .map_err(|e| to_engine_error("list_pods", e))
    }

    async fn list_ready_schedulable_nodes(&self, exclude: &str) -> Result<Vec<Node>, EngineError> {
        let nodes = self.list_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.metadata.name.as_deref() != Some(exclude) && is_ready_schedulable(n))
            .collect())
    }

    async fn cordon(&self, node_name: &str) -> Result<(), EngineError> {
        let patch = Patch::Merge(json!({ "spec": { "unschedulable": true } }));
        self.nodes()
            .patch(node_name, &PatchParams::default(), &patch)
            .await
            .map(|_| ())
            .map_err(|e| to_engine_error("cordon", e))
    }

    async fn uncordon(&self, node_name: &str) -> Result<(), EngineError> {
        let patch = Patch::Merge(json!({ "spec": { "unschedulable": false } }));
        self.nodes()
            .patch(node_name, &PatchParams::default(), &patch)
            .await
            .map(|_| ())
            .map_err(|e| to_engine_error("uncordon", e))
    }

    async fn annotate_node(&self, node_name: &str, annotations: HashMap<String, String>) -> Result<(), EngineError> {
        let patch = Patch::Merge(json!({ "metadata": { "annotations": annotations } }));
        self.nodes()
            .patch(node_name, &PatchParams::default(), &patch)
            .await
            .map(|_| ())
            .map_err(|e| to_engine_error("annotate_node", e))
    }

    async fn list_pdbs(&self, namespace: &str) -> Result<Vec<PodDisruptionBudget>, EngineError> {
        self.pdbs(namespace)
            .list(&ListParams::default())
            .await
            .map(|l| l.items)
            .map_err(|e| to_engine_error("list_pdbs", e))
    }

    async fn evict_pod(&self, namespace: &str, name: &str, grace_period_seconds: u32) -> EvictOutcome {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let evict_params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_period_seconds),
                ..DeleteParams::default()
            }),
            ..EvictParams::default()
        };
        match pods.evict(name, &evict_params).await {
            Ok(_) => EvictOutcome::Success,
            Err(kube::Error::Api(ae)) if ae.code == 404 => EvictOutcome::NotFound,
            Err(kube::Error::Api(ae)) if ae.code == 429 => EvictOutcome::TooManyRequests,
            Err(e) => EvictOutcome::Other(e.to_string()),
        }
    }

    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>, EngineError> {
        self.pvcs(namespace)
            .list(&ListParams::default())
            .await
            .map(|l| l.items)
            .map_err(|e| to_engine_error("list_pvcs", e))
    }

    async fn get_pv(&self, name: &str) -> Result<PersistentVolume, EngineError> {
        self.pvs()
            .get(name)
            .await
            .map_err(|e| to_engine_error("get_pv", e))
    }
}
