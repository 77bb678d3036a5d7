//! End-to-end orchestrator scenarios (spec.md §8, scenarios 1-4) driven
//! entirely through the public API against a mocked cluster.

mod common;

use chrono::{TimeZone, Utc, Weekday};
use std::sync::Arc;

use scale_down_engine::domain::{NodeGroup, ScaleDownState};
use scale_down_engine::k8s::MockClusterClient;
use scale_down_engine::observability::MetricsRecorder;
use scale_down_engine::policy::{Mode, PolicyConfig, PolicyEngine, TimeWindow};
use scale_down_engine::store::{UtilizationSample, UtilizationStore};
use scale_down_engine::{EngineConfig, ScaleDownOrchestrator};

fn managed_group(name: &str, min_nodes: i32, node_names: Vec<&str>) -> NodeGroup {
    NodeGroup {
        name: name.to_string(),
        namespace: "default".to_string(),
        min_nodes,
        max_nodes: 10,
        scale_down_enabled: true,
        managed: true,
        node_names: node_names.into_iter().map(str::to_string).collect(),
    }
}

fn underutilized_store(store: &UtilizationStore, node: &str, now: chrono::DateTime<Utc>) {
    for i in 0..10 {
        store.append_sample(
            node,
            UtilizationSample {
                timestamp: now - chrono::Duration::minutes(9 - i),
                cpu_percent: 20.0,
                memory_percent: 20.0,
            },
            50.0,
            50.0,
            chrono::Duration::minutes(10),
        );
    }
}

fn busy_store(store: &UtilizationStore, node: &str, now: chrono::DateTime<Utc>) {
    store.append_sample(
        node,
        UtilizationSample { timestamp: now, cpu_percent: 70.0, memory_percent: 70.0 },
        50.0,
        50.0,
        chrono::Duration::minutes(10),
    );
}

/// Scenario 1: happy path — node A sustained underutilized drains cleanly.
#[tokio::test]
async fn happy_path_drains_the_sole_underutilized_node() {
    let now = Utc::now();
    let mut mock = MockClusterClient::new();

    mock.expect_list_nodes_in_group().returning(|_| {
        Ok(vec![
            common::metrics_node("node-a", "4", "8Gi"),
            common::metrics_node("node-b", "4", "8Gi"),
            common::metrics_node("node-c", "4", "8Gi"),
        ])
    });
    mock.expect_list_pods_on_node()
        .times(2)
        .returning(|_| Ok(vec![common::pod_on_node("app-1", "default", "node-a", "100m", "128Mi")]));
    mock.expect_list_ready_schedulable_nodes().returning(|_| {
        Ok(vec![common::metrics_node("node-b", "4", "8Gi"), common::metrics_node("node-c", "4", "8Gi")])
    });
    mock.expect_list_pods().returning(|_| Ok(vec![common::pod_on_node("app-1", "default", "node-a", "100m", "128Mi")]));
    mock.expect_cordon().returning(|_| Ok(()));
    mock.expect_list_pdbs().returning(|_| Ok(vec![]));
    mock.expect_annotate_node().returning(|_, _| Ok(()));
    mock.expect_evict_pod().returning(|_, _, _| scale_down_engine::k8s::EvictOutcome::Success);
    mock.expect_list_pods_on_node().returning(|_| Ok(vec![]));

    let store = Arc::new(UtilizationStore::new(50));
    underutilized_store(&store, "node-a", now);
    busy_store(&store, "node-b", now);
    busy_store(&store, "node-c", now);

    let config = EngineConfig::default();
    let policy = Arc::new(PolicyEngine::new(PolicyConfig::from_engine_config(&config)));
    let state = Arc::new(ScaleDownState::new());
    let metrics = Arc::new(MetricsRecorder::new());
    let orchestrator = ScaleDownOrchestrator::new(Arc::new(mock), store, state, policy, metrics, config);

    let group = managed_group("workers", 1, vec!["node-a", "node-b", "node-c"]);
    let report = orchestrator.reconcile(&group).await.unwrap();

    assert_eq!(report.drains_succeeded, 1);
    assert!(report.blocked.is_empty());
    assert!(report.errored.is_empty());
}

/// Scenario 2: cooldown — a recent drain on the group blocks a second one.
#[tokio::test]
async fn recent_scale_down_blocks_on_cooldown() {
    let now = Utc::now();
    let mut mock = MockClusterClient::new();
    mock.expect_list_nodes_in_group().returning(|_| Ok(vec![common::metrics_node("node-a", "4", "8Gi")]));
    mock.expect_list_pods_on_node()
        .returning(|_| Ok(vec![common::pod_on_node("app-1", "default", "node-a", "100m", "128Mi")]));

    let store = Arc::new(UtilizationStore::new(50));
    underutilized_store(&store, "node-a", now);

    let config = EngineConfig::default();
    let policy = Arc::new(PolicyEngine::new(PolicyConfig::from_engine_config(&config)));
    let state = Arc::new(ScaleDownState::new());
    state.record_scale_down("workers", now - chrono::Duration::minutes(5));
    let metrics = Arc::new(MetricsRecorder::new());
    let orchestrator = ScaleDownOrchestrator::new(Arc::new(mock), store, state, policy, metrics, config);

    let group = managed_group("workers", 1, vec!["node-a"]);
    let report = orchestrator.reconcile(&group).await.unwrap();

    assert_eq!(report.drains_succeeded, 0);
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].1, scale_down_engine::BlockReason::Cooldown);
}

/// Scenario 3: a zero-disruption PDB blocks the drain before eviction, and
/// the node is rolled back to schedulable.
#[tokio::test]
async fn pdb_with_no_disruptions_left_blocks_drain_and_rolls_back() {
    let now = Utc::now();
    let mut mock = MockClusterClient::new();

    mock.expect_list_nodes_in_group().returning(|_| {
        Ok(vec![common::metrics_node("node-a", "4", "8Gi"), common::metrics_node("node-b", "4", "8Gi")])
    });
    mock.expect_list_pods_on_node()
        .times(2)
        .returning(|_| Ok(vec![common::pod_on_node("web-1", "default", "node-a", "100m", "128Mi")]));
    mock.expect_list_ready_schedulable_nodes().returning(|_| Ok(vec![common::metrics_node("node-b", "4", "8Gi")]));
    mock.expect_list_pods().returning(|_| Ok(vec![common::pod_on_node("web-1", "default", "node-a", "100m", "128Mi")]));
    mock.expect_cordon().returning(|_| Ok(()));
    mock.expect_list_pdbs().returning(|_| {
        use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec, PodDisruptionBudgetStatus};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
        use std::collections::BTreeMap;
        Ok(vec![PodDisruptionBudget {
            metadata: ObjectMeta { name: Some("web-pdb".to_string()), ..Default::default() },
            spec: Some(PodDisruptionBudgetSpec {
                selector: Some(LabelSelector { match_labels: Some(BTreeMap::new()), ..Default::default() }),
                ..Default::default()
            }),
            status: Some(PodDisruptionBudgetStatus { disruptions_allowed: 0, ..Default::default() }),
        }])
    });
    mock.expect_uncordon().returning(|_| Ok(()));

    let store = Arc::new(UtilizationStore::new(50));
    underutilized_store(&store, "node-a", now);
    busy_store(&store, "node-b", now);

    let config = EngineConfig::default();
    let policy = Arc::new(PolicyEngine::new(PolicyConfig::from_engine_config(&config)));
    let state = Arc::new(ScaleDownState::new());
    let metrics = Arc::new(MetricsRecorder::new());
    let orchestrator = ScaleDownOrchestrator::new(Arc::new(mock), store, state, policy, metrics, config);

    let group = managed_group("workers", 1, vec!["node-a", "node-b"]);
    let report = orchestrator.reconcile(&group).await.unwrap();

    assert_eq!(report.drains_succeeded, 0);
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].1, scale_down_engine::BlockReason::Pdb);
}

/// Scenario 4: an overnight aggressive window doubles max-concurrency and
/// lowers thresholds, exactly as the `production` preset's night window.
#[test]
fn overnight_production_window_raises_concurrency() {
    let config = EngineConfig::default();
    let policy = PolicyEngine::production(&config);

    let night = Utc.with_ymd_and_hms(2026, 7, 28, 2, 30, 0).unwrap(); // Tuesday 02:30
    assert_eq!(policy.current_mode_at(night), Mode::Aggressive);

    let midday = Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap();
    assert_eq!(policy.current_mode_at(midday), Mode::Conservative);

    // A custom single-day window, confirming TimeWindow composes with any
    // day-set rather than just "every day".
    policy.set_windows(vec![TimeWindow::new(Mode::Aggressive, vec![Weekday::Tue], 2, 5)]);
    assert_eq!(policy.current_mode_at(night), Mode::Aggressive);
    let wednesday_night = Utc.with_ymd_and_hms(2026, 7, 29, 2, 30, 0).unwrap();
    assert_eq!(policy.current_mode_at(wednesday_night), Mode::Balanced);

    // Concurrency/threshold doubling itself is wall-clock independent: force
    // each mode directly, the way the engine resolves it once a window match
    // has already selected it.
    policy.set_windows(Vec::new());
    policy.set_default_mode(Mode::Aggressive);
    assert_eq!(policy.get_max_concurrent(), config.max_drains_per_cycle * 2);
    policy.set_default_mode(Mode::Conservative);
    assert_eq!(policy.get_max_concurrent(), 1);
    assert!(policy.should_delay_scale_down());
}
