//! Local storage check (spec.md §4.4 step 1): block if any non-terminal
//! candidate pod carries a HostPath volume, a non-memory `emptyDir`, or a PVC
//! bound to a Local PersistentVolume. A PVC whose PV cannot be fetched fails
//! closed.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use std::collections::HashMap;

use crate::domain::is_terminal_pod;
use crate::error::{BlockReason, SafetyBlock};
use crate::k8s::ClusterClient;

pub async fn check<C: ClusterClient + ?Sized>(pods: &[Pod], cluster: &C) -> Result<(), SafetyBlock> {
    let mut pvc_cache: HashMap<String, Vec<PersistentVolumeClaim>> = HashMap::new();

    for pod in pods {
        if is_terminal_pod(pod) {
            continue;
        }
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let Some(spec) = &pod.spec else { continue };
        let Some(volumes) = &spec.volumes else { continue };

        for volume in volumes {
            if volume.host_path.is_some() {
                return Err(SafetyBlock::new(
                    BlockReason::LocalStorage,
                    format!("pod {namespace}/{pod_name} uses HostPath volume {}", volume.name),
                ));
            }
            if let Some(empty_dir) = &volume.empty_dir {
                if empty_dir.medium.as_deref() != Some("Memory") {
                    return Err(SafetyBlock::new(
                        BlockReason::LocalStorage,
                        format!("pod {namespace}/{pod_name} uses non-memory emptyDir volume {}", volume.name),
                    ));
                }
            }
            let Some(pvc_source) = &volume.persistent_volume_claim else {
                continue;
            };
            let claim_name = pvc_source.claim_name.clone();

            if !pvc_cache.contains_key(&namespace) {
                match cluster.list_pvcs(&namespace).await {
                    Ok(list) => {
                        pvc_cache.insert(namespace.clone(), list);
                    }
                    Err(e) => {
                        return Err(SafetyBlock::new(
                            BlockReason::LocalStorage,
                            format!("failed to list PVCs in {namespace} for pod {pod_name}, failing closed: {e}"),
                        ));
                    }
                }
            }
            let pvcs = pvc_cache.get(&namespace).expect("just inserted or present");
            let Some(pvc) = pvcs.iter().find(|p| p.metadata.name.as_deref() == Some(claim_name.as_str())) else {
                continue;
            };
            let Some(volume_name) = pvc.spec.as_ref().and_then(|s| s.volume_name.clone()) else {
                continue;
            };
            match cluster.get_pv(&volume_name).await {
                Ok(pv) => {
                    let is_local = pv.spec.as_ref().map(|s| s.local.is_some()).unwrap_or(false);
                    if is_local {
                        return Err(SafetyBlock::new(
                            BlockReason::LocalStorage,
                            format!("pod {namespace}/{pod_name} binds PVC {claim_name} to local PV {volume_name}"),
                        ));
                    }
                }
                Err(e) => {
                    return Err(SafetyBlock::new(
                        BlockReason::LocalStorage,
                        format!("failed to fetch PV {volume_name} for pod {pod_name}, failing closed: {e}"),
                    ));
                }
            }
        }
    }
    Ok(())
}
