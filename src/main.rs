use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

mod cli;

use cli::{Args, Commands, PolicyPreset};
use scale_down_engine::domain::{load_node_groups_file, ScaleDownState};
use scale_down_engine::k8s::{KubeClusterClient, KubeMetricsClient};
use scale_down_engine::observability::MetricsRecorder;
use scale_down_engine::policy::PolicyEngine;
use scale_down_engine::sampler::Sampler;
use scale_down_engine::store::UtilizationStore;
use scale_down_engine::{EngineConfig, ScaleDownOrchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Commands::Run {
            config_file,
            node_groups_file,
            kubeconfig,
            group_label_key,
            mode,
            once,
            reconcile_interval_secs,
        } => {
            run(
                config_file,
                node_groups_file,
                kubeconfig,
                group_label_key,
                mode,
                once,
                reconcile_interval_secs,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    config_file: Option<String>,
    node_groups_file: String,
    kubeconfig: Option<String>,
    group_label_key: String,
    mode: PolicyPreset,
    once: bool,
    reconcile_interval_secs: u64,
) -> Result<()> {
    let config = match config_file {
        Some(path) => EngineConfig::from_yaml_file(&path).context("loading engine config")?,
        None => EngineConfig::default(),
    };

    let node_groups = load_node_groups_file(&node_groups_file).context("loading node groups file")?;
    info!("loaded {} node group(s) from {node_groups_file}", node_groups.len());

    if let Some(path) = &kubeconfig {
        std::env::set_var("KUBECONFIG", path);
    }

    let cluster = Arc::new(
        KubeClusterClient::new(kubeconfig.as_deref(), group_label_key)
            .await
            .context("building cluster client")?,
    );
    let raw_client = kube::Client::try_default().await.context("building metrics client")?;
    let metrics_client = Arc::new(KubeMetricsClient::new(raw_client));

    let policy = Arc::new(match mode {
        PolicyPreset::Production => PolicyEngine::production(&config),
        PolicyPreset::Development => PolicyEngine::development(&config),
        PolicyPreset::CostSaving => PolicyEngine::cost_saving(&config),
    });
    let store = Arc::new(UtilizationStore::new(config.max_samples_per_node));
    let state = Arc::new(ScaleDownState::new());
    let metrics = Arc::new(MetricsRecorder::new());

    let sampler = Sampler::new(Arc::clone(&cluster), Arc::clone(&metrics_client), Arc::clone(&store));
    let orchestrator = ScaleDownOrchestrator::new(
        Arc::clone(&cluster),
        Arc::clone(&store),
        Arc::clone(&state),
        Arc::clone(&policy),
        Arc::clone(&metrics),
        config.clone(),
    );

    loop {
        let thresholds = policy.get_thresholds();
        if let Err(e) = sampler
            .run_pass(
                thresholds.cpu_threshold,
                thresholds.memory_threshold,
                chrono::Duration::seconds(thresholds.observation_window_secs as i64),
            )
            .await
        {
            warn!("sampler pass failed: {e}");
        }

        for group in &node_groups {
            match orchestrator.reconcile(group).await {
                Ok(report) => {
                    if report.drains_succeeded > 0 || !report.blocked.is_empty() || !report.errored.is_empty() {
                        info!(
                            "reconciled group {}: {} drained, {} blocked, {} errored",
                            group.name,
                            report.drains_succeeded,
                            report.blocked.len(),
                            report.errored.len()
                        );
                    }
                }
                Err(e) => warn!("reconcile of group {} failed: {e}", group.name),
            }
        }

        if once {
            break;
        }
        tokio::time::sleep(Duration::from_secs(reconcile_interval_secs)).await;
    }

    Ok(())
}
