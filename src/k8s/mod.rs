pub mod client;
pub mod metrics_client;

pub use client::{ClusterClient, EvictOutcome, KubeClusterClient};
pub use metrics_client::{KubeMetricsClient, MetricsClient, NodeMetricSample};

#[cfg(feature = "mock")]
pub use client::MockClusterClient;
#[cfg(feature = "mock")]
pub use metrics_client::MockMetricsClient;
