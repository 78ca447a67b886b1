//! Node Census
//!
//! Derives the set of nodes eligible for new replicas from the node cache.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::sync::Arc;

/// Whether the node reports its `Ready` condition as `True`
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Names of the ready nodes, sorted by name
pub fn ready_nodes(nodes: &[Arc<Node>]) -> Vec<String> {
    let mut ready: Vec<String> = nodes
        .iter()
        .filter(|n| is_node_ready(n))
        .map(|n| n.name_any())
        .collect();
    ready.sort();
    ready.dedup();
    ready
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use kube::api::ObjectMeta;

    pub(crate) fn node(name: &str, ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![
                    NodeCondition {
                        type_: "MemoryPressure".into(),
                        status: "False".into(),
                        ..Default::default()
                    },
                    NodeCondition {
                        type_: "Ready".into(),
                        status: if ready { "True" } else { "False" }.into(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_only_ready_nodes_are_kept() {
        let nodes = vec![
            Arc::new(node("n3", true)),
            Arc::new(node("n1", true)),
            Arc::new(node("n2", false)),
            Arc::new(Node {
                metadata: ObjectMeta {
                    name: Some("n4".into()),
                    ..Default::default()
                },
                ..Default::default()
            }),
        ];
        assert_eq!(ready_nodes(&nodes), vec!["n1".to_string(), "n3".to_string()]);
    }

    #[test]
    fn test_node_without_conditions_is_not_ready() {
        assert!(!is_node_ready(&Node::default()));
        assert!(is_node_ready(&node("n1", true)));
    }
}
