//! Protected node check (spec.md §4.4 step 6): the last gate, blocking
//! removal of nodes explicitly marked to resist scale-down.

use k8s_openapi::api::core::v1::Node;

use crate::domain::node_is_protected;
use crate::error::{BlockReason, SafetyBlock};

pub fn check(node: &Node) -> Result<(), SafetyBlock> {
    if node_is_protected(node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        return Err(SafetyBlock::new(BlockReason::ProtectedNode, format!("node {name} is protected")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::tests::node_with_allocatable;
    use std::collections::BTreeMap;

    #[test]
    fn protected_annotation_blocks() {
        let mut node = node_with_allocatable("node-a", "4", "8Gi");
        node.metadata.annotations = Some(BTreeMap::from([("protected".to_string(), "true".to_string())]));
        assert_eq!(check(&node).unwrap_err().reason, BlockReason::ProtectedNode);
    }

    #[test]
    fn unprotected_node_passes() {
        let node = node_with_allocatable("node-a", "4", "8Gi");
        assert!(check(&node).is_ok());
    }
}
