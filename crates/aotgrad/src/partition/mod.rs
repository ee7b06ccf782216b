//! Splitting a joint graph into forward and backward graphs.
//!
//! Both partitioners produce a [`Partition`] with the same calling convention:
//!
//! ```text
//! forward : primals                 -> forward outputs ++ saved
//! backward: saved ++ tangents       -> gradients
//! ```
//!
//! [`DefaultPartitioner`] colours everything downstream of a tangent as backward and saves the
//! values crossing into that region. The min-cut partitioner (feature `min-cut`) instead
//! chooses the cheapest saved set under a [`RecomputePolicy`], recomputing cheap operators in
//! the backward graph.

mod default;
#[cfg(feature = "min-cut")]
pub mod mincut;
mod recompute;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use default::DefaultPartitioner;
#[cfg(feature = "min-cut")]
pub use mincut::{Capacity, MinCut, MinCutPartitioner};
pub use recompute::RecomputePolicy;

use crate::error::ConfigError;
use crate::graph::{extract_subgraph, Graph, GraphError, InputRole, JointGraph, NodeId};

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("minimum cut is unbounded: backward needs `{node}`, which has no size metadata")]
    UnboundedCut { node: String },
    #[error("cut edge {edge} does not separate a node from its own output")]
    CutCrossesAnchor { edge: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Forward and backward graphs plus the values threaded between them.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub forward: Graph,
    pub backward: Graph,
    /// Names of the saved values, in the order the forward graph returns them.
    pub saved: Vec<String>,
    pub num_fwd_outputs: usize,
}

impl Partition {
    pub fn num_saved(&self) -> usize {
        self.saved.len()
    }

    /// Byte footprint of the saved values, when every one of them carries metadata.
    pub fn saved_nbytes(&self) -> Option<u64> {
        self.backward
            .inputs()
            .take(self.saved.len())
            .map(|node| node.meta.as_ref().map(|meta| meta.nbytes()))
            .sum()
    }
}

pub trait Partitioner: Send + Sync {
    fn name(&self) -> &'static str;

    fn partition(&self, joint: &JointGraph) -> Result<Partition, PartitionError>;
}

/// How the post-cut cleanup drops saved values the backward graph never reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Refinement {
    /// Drop unused saved values once and rebuild both graphs.
    #[default]
    SinglePass,
    /// Repeat until every saved value has a backward consumer.
    FixedPoint,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionerKind {
    #[default]
    Default,
    MinCut,
}

impl PartitionerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PartitionerKind::Default => "default",
            PartitionerKind::MinCut => "min-cut",
        }
    }

    /// Instantiates the partitioner. Fails when the min-cut partitioner is requested from a
    /// build without the `min-cut` feature.
    pub fn build(self, policy: RecomputePolicy) -> Result<Arc<dyn Partitioner>, ConfigError> {
        match self {
            PartitionerKind::Default => Ok(Arc::new(DefaultPartitioner)),
            #[cfg(feature = "min-cut")]
            PartitionerKind::MinCut => Ok(Arc::new(MinCutPartitioner::new(policy))),
            #[cfg(not(feature = "min-cut"))]
            PartitionerKind::MinCut => {
                let _ = policy;
                Err(ConfigError::MissingCapability {
                    partitioner: self.as_str(),
                    feature: "min-cut",
                })
            }
        }
    }
}

impl fmt::Display for PartitionerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(PartitionerKind::Default),
            "min-cut" | "mincut" | "min_cut" => Ok(PartitionerKind::MinCut),
            other => Err(ConfigError::UnknownPartitioner(other.to_string())),
        }
    }
}

/// Builds both graphs around an explicit saved set with the extractor, then drops saved
/// values that end up without a consumer in the backward graph and rebuilds.
///
/// # Panics
/// Panics if the saved set does not make every gradient computable from saved values and
/// tangents; that is a partitioner bug.
pub fn split_with_saved_values(
    joint: &JointGraph,
    mut saved: Vec<NodeId>,
    refinement: Refinement,
) -> Partition {
    let graph = joint.graph();
    let primals: Vec<NodeId> = graph
        .inputs()
        .filter(|node| node.input_role() != Some(InputRole::Tangent))
        .map(|node| node.id)
        .collect();
    let tangents = graph.tangent_inputs();

    let mut rebuilds = 0usize;
    loop {
        let (forward, backward) = extract_pair(joint, &primals, &tangents, &saved);

        let users = backward.users();
        let unused: HashSet<usize> = backward
            .inputs()
            .take(saved.len())
            .enumerate()
            .filter(|(_, node)| users[node.id.index()].is_empty())
            .map(|(position, _)| position)
            .collect();

        let done = match refinement {
            Refinement::SinglePass => rebuilds == 1,
            Refinement::FixedPoint => false,
        };
        if unused.is_empty() || done {
            let names = saved
                .iter()
                .map(|&id| graph.node(id).name.clone())
                .collect();
            return Partition {
                forward,
                backward,
                saved: names,
                num_fwd_outputs: joint.num_fwd_outputs(),
            };
        }

        log::debug!(
            "dropping {} saved value(s) without backward users",
            unused.len()
        );
        saved = saved
            .into_iter()
            .enumerate()
            .filter(|(position, _)| !unused.contains(position))
            .map(|(_, id)| id)
            .collect();
        rebuilds += 1;
    }
}

fn extract_pair(
    joint: &JointGraph,
    primals: &[NodeId],
    tangents: &[NodeId],
    saved: &[NodeId],
) -> (Graph, Graph) {
    let graph = joint.graph();
    let mut fwd_outputs = joint.forward_outputs().to_vec();
    fwd_outputs.extend_from_slice(saved);
    let forward = extract_subgraph(graph, primals, &fwd_outputs);

    let mut bwd_inputs = saved.to_vec();
    bwd_inputs.extend_from_slice(tangents);
    let backward = extract_subgraph(graph, &bwd_inputs, joint.backward_outputs());
    (forward, backward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::text::parse_graph;

    const JOINT: &str = r#"
graph @joint {
  %x: primal f32[4]
  %t: tangent f32[4]
  %a = exp(%x) : f32[4]
  %b = neg(%x) : f32[4]
  %g = mul(%t, %a) : f32[4]
  return (%a, %g)
}
"#;

    fn joint() -> JointGraph {
        JointGraph::new(parse_graph(JOINT).expect("parse"), 1).expect("split")
    }

    #[test]
    fn unused_saved_values_are_dropped() {
        let joint = joint();
        let graph = joint.graph();
        let saved = vec![graph.find("b").expect("b"), graph.find("a").expect("a")];
        let partition = split_with_saved_values(&joint, saved, Refinement::SinglePass);
        assert_eq!(partition.saved, vec!["a".to_string()]);
        assert_eq!(partition.forward.output_values().len(), 2);
        assert_eq!(partition.backward.num_inputs(), 2);
        assert_eq!(partition.saved_nbytes(), Some(16));
    }

    #[test]
    fn fixed_point_matches_single_pass_on_simple_graphs() {
        let joint = joint();
        let graph = joint.graph();
        let saved = vec![graph.find("b").expect("b"), graph.find("a").expect("a")];
        let single = split_with_saved_values(&joint, saved.clone(), Refinement::SinglePass);
        let fixed = split_with_saved_values(&joint, saved, Refinement::FixedPoint);
        assert_eq!(single, fixed);
    }

    #[test]
    fn partitioner_kind_parses_env_spellings() {
        assert_eq!("default".parse::<PartitionerKind>(), Ok(PartitionerKind::Default));
        assert_eq!(" Min-Cut ".parse::<PartitionerKind>(), Ok(PartitionerKind::MinCut));
        assert!(matches!(
            "greedy".parse::<PartitionerKind>(),
            Err(ConfigError::UnknownPartitioner(_))
        ));
    }

    #[cfg(not(feature = "min-cut"))]
    #[test]
    fn min_cut_without_feature_is_a_config_error() {
        let err = PartitionerKind::MinCut
            .build(RecomputePolicy::default())
            .err()
            .expect("missing capability");
        assert!(matches!(err, ConfigError::MissingCapability { .. }));
    }
}
