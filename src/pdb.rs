//! PDB Validator (C5, spec.md §4.5): for a set of candidate pods, verifies
//! every matching PodDisruptionBudget currently permits at least one
//! disruption. Pure given its inputs plus one cluster listing per namespace.

use k8s_openapi::api::core::v1::Pod;
use std::collections::{BTreeMap, HashMap};

use crate::error::{BlockReason, SafetyBlock};
use crate::k8s::ClusterClient;
use crate::utils::label_selector;

/// Groups `pods` by namespace, lists PDBs per namespace, and blocks on the
/// first PDB that matches at least one candidate pod and has
/// `disruptions_allowed == 0`. PDBs matching zero candidates are ignored.
pub async fn validate<C: ClusterClient + ?Sized>(pods: &[Pod], cluster: &C) -> Result<(), SafetyBlock> {
    let by_namespace = group_by_namespace(pods);

    for (namespace, namespace_pods) in &by_namespace {
        let pdbs = cluster.list_pdbs(namespace).await.map_err(|e| {
            SafetyBlock::new(
                BlockReason::Pdb,
                format!("failed to list PodDisruptionBudgets in {namespace}, failing closed: {e}"),
            )
        })?;

        for pdb in &pdbs {
            let Some(selector) = pdb.spec.as_ref().and_then(|s| s.selector.as_ref()) else {
                continue;
            };
            let matches_any = namespace_pods.iter().any(|pod| {
                let empty = BTreeMap::new();
                let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
                label_selector::matches(selector, labels)
            });
            if !matches_any {
                continue;
            }
            let disruptions_allowed = pdb.status.as_ref().map(|s| s.disruptions_allowed).unwrap_or(0);
            if disruptions_allowed <= 0 {
                let pdb_name = pdb.metadata.name.clone().unwrap_or_default();
                return Err(SafetyBlock::new(
                    BlockReason::Pdb,
                    format!("PodDisruptionBudget {namespace}/{pdb_name} allows 0 disruptions"),
                ));
            }
        }
    }
    Ok(())
}

fn group_by_namespace(pods: &[Pod]) -> HashMap<String, Vec<Pod>> {
    let mut map: HashMap<String, Vec<Pod>> = HashMap::new();
    for pod in pods {
        let namespace = pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        map.entry(namespace).or_default().push(pod.clone());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::MockClusterClient;
    use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec, PodDisruptionBudgetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use k8s_openapi::api::core::v1::PodSpec;

    fn pod(name: &str, namespace: &str, app: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: None,
        }
    }

    fn pdb(name: &str, app: &str, disruptions_allowed: i32) -> PodDisruptionBudget {
        PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PodDisruptionBudgetStatus {
                disruptions_allowed,
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn blocks_when_matching_pdb_allows_zero_disruptions() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_pdbs()
            .withf(|ns| ns == "default")
            .returning(|_| Ok(vec![pdb("web-pdb", "web", 0)]));
        let pods = vec![pod("web-1", "default", "web")];
        let result = validate(&pods, &mock).await;
        assert_eq!(result.unwrap_err().reason, BlockReason::Pdb);
    }

    #[tokio::test]
    async fn ignores_pdb_with_no_matching_pods() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_pdbs()
            .returning(|_| Ok(vec![pdb("other-pdb", "other", 0)]));
        let pods = vec![pod("web-1", "default", "web")];
        assert!(validate(&pods, &mock).await.is_ok());
    }

    #[tokio::test]
    async fn allows_when_pdb_has_remaining_disruption_budget() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_pdbs().returning(|_| Ok(vec![pdb("web-pdb", "web", 2)]));
        let pods = vec![pod("web-1", "default", "web")];
        assert!(validate(&pods, &mock).await.is_ok());
    }
}
