//! Metrics client contract (spec.md §6), called only by the Sampler (C2).
//! Builds the raw `metrics.k8s.io/v1beta1` request by hand, since
//! `kube`/`k8s-openapi` have no typed bindings for the metrics API.

use async_trait::async_trait;
use http::Request;
use kube::Client;
use serde::Deserialize;

use crate::error::EngineError;

/// One node's raw usage reading from `metrics.k8s.io`.
#[derive(Debug, Clone)]
pub struct NodeMetricSample {
    pub node_name: String,
    /// Raw Kubernetes CPU quantity string, e.g. `"250m"`.
    pub cpu_usage: String,
    /// Raw Kubernetes memory quantity string, e.g. `"512Mi"`.
    pub memory_usage: String,
}

/// Narrow metrics-API surface (spec.md §6). Only the Sampler calls this.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Returns per-node usage, or `None` if metrics-server is unavailable.
    async fn list_node_metrics(&self) -> Result<Option<Vec<NodeMetricSample>>, EngineError>;
}

pub struct KubeMetricsClient {
    client: Client,
}

impl KubeMetricsClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsClient for KubeMetricsClient {
    async fn list_node_metrics(&self) -> Result<Option<Vec<NodeMetricSample>>, EngineError> {
        let req = Request::builder()
            .method("GET")
            .uri("/apis/metrics.k8s.io/v1beta1/nodes")
            .body(vec![])
            .map_err(|e| EngineError::transient(format!("build metrics request: {e}")))?;
        let list: NodeMetricsList = match self.client.request(req).await {
            Ok(l) => l,
            Err(_) => return Ok(None),
        };
        let out = list
            .items
            .into_iter()
            .map(|m| NodeMetricSample {
                node_name: m.metadata.name,
                cpu_usage: m.usage.get("cpu").cloned().unwrap_or_else(|| "0".to_string()),
                memory_usage: m.usage.get("memory").cloned().unwrap_or_else(|| "0".to_string()),
            })
            .collect();
        Ok(Some(out))
    }
}

#[derive(Deserialize)]
struct NodeMetricsList {
    items: Vec<NodeMetrics>,
}

#[derive(Deserialize)]
struct NodeMetrics {
    metadata: NodeMetricsMeta,
    usage: std::collections::HashMap<String, String>,
}

#[derive(Deserialize)]
struct NodeMetricsMeta {
    name: String,
}
