//! Single construction-time configuration struct (spec.md §6), loadable from
//! a YAML file with CLI flags layered on top — the same two-step pattern
//! `K8sClient::new` uses for `KUBECONFIG` (env override layered under an
//! explicit `--config-file` flag).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// CPU/memory thresholds plus the operational knobs spec.md §6 lists as the
/// construction-time configuration struct. Defaults are the ones §6 names:
/// 50% / 50% / 10min / 10min / 5 / true / 5min / 30s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cpu_threshold_percent: f64,
    pub memory_threshold_percent: f64,
    pub observation_window_secs: u64,
    pub cooldown_secs: u64,
    pub max_drains_per_cycle: usize,
    pub enable_pdb_validation: bool,
    pub drain_timeout_secs: u64,
    pub eviction_grace_period_secs: u32,

    /// Sampling interval for the Sampler (C2). Not in the §6 table, which
    /// covers the Orchestrator/Drainer; recorded separately since it drives
    /// a different component's cadence.
    pub sampling_interval_secs: u64,
    /// Bounded ring size (N) for per-node samples (spec.md §3, N=50).
    pub max_samples_per_node: usize,
    /// Staleness ceiling for store entries (spec.md §3, default 5 min).
    pub staleness_ceiling_secs: u64,

    /// Gates the extended (taint/toleration/anti-affinity-aware) scheduling
    /// simulation from spec.md §4.4.1 vs. the simple approximation in §4.4
    /// step 4. Default off, per §9's "required ... for taint/toleration
    /// sensitive workloads" framing (opt-in, not universal).
    pub extended_scheduling_simulation: bool,

    /// Retry budget for the eviction phase (spec.md §4.6 step 5: 12 retries
    /// at 5s intervals).
    pub eviction_max_retries: u32,
    pub eviction_retry_interval_secs: u64,
    /// Poll interval while waiting for pod termination (spec.md §4.6 step 6).
    pub termination_poll_interval_secs: u64,
    /// Headroom multiplier for the reschedulability check (spec.md §4.4 step 2).
    pub reschedulability_headroom_multiplier: f64,
    /// Post-removal predicted utilization ceiling (spec.md §4.4 step 5, 85%).
    pub post_removal_utilization_ceiling_percent: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 50.0,
            memory_threshold_percent: 50.0,
            observation_window_secs: 10 * 60,
            cooldown_secs: 10 * 60,
            max_drains_per_cycle: 5,
            enable_pdb_validation: true,
            drain_timeout_secs: 5 * 60,
            eviction_grace_period_secs: 30,
            sampling_interval_secs: 60,
            max_samples_per_node: 50,
            staleness_ceiling_secs: 5 * 60,
            extended_scheduling_simulation: false,
            eviction_max_retries: 12,
            eviction_retry_interval_secs: 5,
            termination_poll_interval_secs: 5,
            reschedulability_headroom_multiplier: 1.2,
            post_removal_utilization_ceiling_percent: 85.0,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file, falling back to defaults for
    /// any field the file omits (via `#[serde(default)]` on the struct).
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let cfg: EngineConfig = serde_yaml::from_str(&contents)?;
        Ok(cfg)
    }

    pub fn observation_window(&self) -> Duration {
        Duration::from_secs(self.observation_window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn staleness_ceiling(&self) -> Duration {
        Duration::from_secs(self.staleness_ceiling_secs)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_secs)
    }
}
