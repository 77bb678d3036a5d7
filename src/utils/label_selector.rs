//! Label selector matching shared by the PDB Validator (C5) and the Safety
//! Verifier's anti-affinity check (C4 step 4), grounded on the same
//! In/NotIn/Exists/DoesNotExist semantics spec.md §4.4.1 spells out for
//! node-selector terms.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;

/// An absent `match_labels`/`match_expressions` matches everything; each
/// present clause is AND-combined with the rest.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            if !expression_matches(expr, labels) {
                return false;
            }
        }
    }
    true
}

fn expression_matches(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = expr.values.as_deref().unwrap_or(&[]);
    match expr.operator.as_str() {
        "In" => labels.get(&expr.key).map(|v| values.contains(v)).unwrap_or(false),
        "NotIn" => labels.get(&expr.key).map(|v| !values.contains(v)).unwrap_or(true),
        "Exists" => labels.contains_key(&expr.key),
        "DoesNotExist" => !labels.contains_key(&expr.key),
        _ => false,
    }
}
