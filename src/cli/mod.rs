use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version, about = "VPSie Kubernetes node autoscaler scale-down engine", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the reconcile loop against a live cluster.
    Run {
        /// Engine configuration file (thresholds, cooldown, drain knobs). Defaults
        /// are used for anything the file omits.
        #[arg(long = "config-file", value_name = "PATH")]
        config_file: Option<String>,

        /// YAML file listing the node groups to reconcile (name, namespace,
        /// min/max nodes, managed flag, node names). In a full deployment these
        /// come from the node-group reconciler this engine cooperates with
        /// (spec.md §1); standalone runs read them from disk instead.
        #[arg(long = "node-groups-file", value_name = "PATH")]
        node_groups_file: String,

        /// Kubernetes config file path (defaults to in-cluster/KUBECONFIG inference).
        #[arg(short, long)]
        kubeconfig: Option<String>,

        /// Label key distinguishing node-group membership on Node objects.
        #[arg(long = "group-label-key", default_value = "vpsie.com/node-group")]
        group_label_key: String,

        /// Scale-down policy preset (spec.md §4.3).
        #[arg(long, default_value = "production")]
        mode: PolicyPreset,

        /// Reconcile every group once and exit, instead of looping forever.
        #[arg(long)]
        once: bool,

        /// Seconds between reconcile passes when looping.
        #[arg(long = "reconcile-interval-secs", default_value_t = 60)]
        reconcile_interval_secs: u64,
    },
}

#[derive(Clone, Copy, ValueEnum, Debug, Default)]
#[value(rename_all = "kebab-case")]
pub enum PolicyPreset {
    #[default]
    Production,
    Development,
    CostSaving,
}
