//! Drainer detachment scenario (spec.md §8, scenario 5): the caller cancels
//! mid-eviction, but the drain keeps running to completion on its own
//! deadline instead of stranding the node half-cordoned.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use scale_down_engine::drain::{DrainOutcome, Drainer};
use scale_down_engine::k8s::{EvictOutcome, MockClusterClient};
use scale_down_engine::EngineConfig;

#[tokio::test]
async fn caller_cancellation_mid_eviction_detaches_instead_of_aborting() {
    let mut mock = MockClusterClient::new();

    mock.expect_cordon().times(1).returning(|_| Ok(()));
    mock.expect_list_pods_on_node()
        .times(2)
        .returning(|_| Ok(vec![common::pod_on_node("web-1", "default", "node-a", "100m", "128Mi")]));
    mock.expect_list_pdbs().returning(|_| Ok(vec![]));
    mock.expect_annotate_node().returning(|_, _| Ok(()));
    mock.expect_evict_pod().returning(|_, _, _| EvictOutcome::Success);
    mock.expect_list_pods_on_node().returning(|_| Ok(vec![]));
    mock.expect_uncordon().never();

    let config = EngineConfig {
        drain_timeout_secs: 5,
        termination_poll_interval_secs: 1,
        ..EngineConfig::default()
    };
    let drainer = Drainer::new(Arc::new(mock), &config);

    let token = CancellationToken::new();
    let canceller = token.clone();

    let (outcome, _) = tokio::join!(
        drainer.drain_node("node-a", token),
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        }
    );

    match outcome.unwrap() {
        DrainOutcome::Success { pods_evicted, detached } => {
            assert_eq!(pods_evicted, 1);
            assert!(detached, "drain should report it kept running past caller cancellation");
        }
        other => panic!("expected a detached success, got {other:?}"),
    }
}
