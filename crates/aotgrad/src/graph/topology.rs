use std::collections::HashSet;

use thiserror::Error;

use super::node::{Node, NodeId, NodeKind};

/// Structural violations detected while finishing or loading a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("graph has no output node")]
    MissingOutput,
    #[error("output node `{name}` must be the last node of the graph")]
    OutputNotLast { name: String },
    #[error("node name `{name}` is defined more than once")]
    DuplicateName { name: String },
    #[error("node `{name}` has id {found} but sits at position {expected}")]
    MisnumberedNode {
        name: String,
        expected: u32,
        found: u32,
    },
    #[error("node `{user}` references {missing} before it is defined")]
    ForwardReference { user: String, missing: NodeId },
    #[error("joint graph declares {num_fwd_outputs} forward outputs but returns only {total}")]
    InvalidSplit {
        num_fwd_outputs: usize,
        total: usize,
    },
    #[error("unknown value `{name}`")]
    UnknownValue { name: String },
}

/// Checks the ordering invariants every finished graph upholds: dense ids, unique names,
/// arguments defined before use and exactly one output node in last position.
pub(crate) fn validate_nodes(nodes: &[Node]) -> Result<(), GraphError> {
    let last = nodes.last().ok_or(GraphError::MissingOutput)?;
    if !last.is_output() {
        return Err(GraphError::MissingOutput);
    }

    let mut names = HashSet::with_capacity(nodes.len());
    for (position, node) in nodes.iter().enumerate() {
        if node.id.index() != position {
            return Err(GraphError::MisnumberedNode {
                name: node.name.clone(),
                expected: position as u32,
                found: node.id.0,
            });
        }
        if !names.insert(node.name.as_str()) {
            return Err(GraphError::DuplicateName {
                name: node.name.clone(),
            });
        }
        if matches!(node.kind, NodeKind::Output(_)) && position + 1 != nodes.len() {
            return Err(GraphError::OutputNotLast {
                name: node.name.clone(),
            });
        }
        for arg in node.node_args() {
            if arg.index() >= position {
                return Err(GraphError::ForwardReference {
                    user: node.name.clone(),
                    missing: arg,
                });
            }
        }
    }
    Ok(())
}
