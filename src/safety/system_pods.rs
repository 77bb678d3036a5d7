//! Unique system pods check (spec.md §4.4 step 3): block if the candidate
//! hosts a control-plane singleton in `kube-system`.

use k8s_openapi::api::core::v1::Pod;

use crate::error::{BlockReason, SafetyBlock};

const PROTECTED_SYSTEM_PODS: &[&str] = &[
    "kube-apiserver",
    "etcd",
    "kube-controller-manager",
    "kube-scheduler",
];

pub fn check(pods: &[Pod]) -> Result<(), SafetyBlock> {
    for pod in pods {
        if pod.metadata.namespace.as_deref() != Some("kube-system") {
            continue;
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        if PROTECTED_SYSTEM_PODS.iter().any(|p| name.contains(p)) {
            return Err(SafetyBlock::new(
                BlockReason::SafetyCheck,
                format!("node hosts unique system pod kube-system/{name}"),
            ));
        }
    }
    Ok(())
}
