use std::collections::{HashMap, HashSet};

use super::{Partition, PartitionError, Partitioner};
use crate::graph::extract::promoted_role;
use crate::graph::{
    Arg, Args, Graph, GraphBuilder, GraphError, GraphOutput, JointGraph, NodeId, NodeKind,
};

/// Liveness-colouring partitioner.
///
/// A node is backward when it is a tangent input or reads a backward or saved value. Every
/// non-backward argument of a backward node is saved, in discovery order. The forward graph
/// keeps every non-backward node without pruning.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPartitioner;

impl Partitioner for DefaultPartitioner {
    fn name(&self) -> &'static str {
        "default"
    }

    fn partition(&self, joint: &JointGraph) -> Result<Partition, PartitionError> {
        let graph = joint.graph();
        let mut backward: HashSet<NodeId> = HashSet::new();
        let mut saved: Vec<NodeId> = Vec::new();
        let mut saved_set: HashSet<NodeId> = HashSet::new();

        for node in graph.nodes() {
            match &node.kind {
                NodeKind::Input(_) if node.is_tangent() => {
                    backward.insert(node.id);
                }
                NodeKind::Operation { .. } => {
                    let coloured = node
                        .node_args()
                        .any(|arg| backward.contains(&arg) || saved_set.contains(&arg));
                    if !coloured {
                        continue;
                    }
                    backward.insert(node.id);
                    for arg in node.node_args() {
                        if !backward.contains(&arg) && saved_set.insert(arg) {
                            saved.push(arg);
                        }
                    }
                }
                NodeKind::Input(_) | NodeKind::Output(_) => {}
            }
        }

        // Gradients computed without touching a tangent still have to reach the backward graph.
        for &id in joint.backward_outputs() {
            if !backward.contains(&id) && saved_set.insert(id) {
                saved.push(id);
            }
        }

        let mut bwd = GraphBuilder::new();
        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        for &id in &saved {
            let source = graph.node(id);
            let role = promoted_role(source).ok_or_else(|| unknown(graph, id))?;
            let placeholder = bwd.input(source.name.clone(), role, source.meta.clone());
            remap.insert(id, placeholder);
        }
        for node in graph.nodes() {
            if !backward.contains(&node.id) {
                continue;
            }
            let new_id = match &node.kind {
                NodeKind::Input(role) => bwd.input(node.name.clone(), *role, node.meta.clone()),
                NodeKind::Operation { args, .. } => {
                    bwd.copy_operation(node, remap_args(args, &remap))
                }
                NodeKind::Output(_) => continue,
            };
            remap.insert(node.id, new_id);
        }
        let bwd_outputs = resolve(graph, &remap, joint.backward_outputs())?;
        let backward_graph = bwd.finish(GraphOutput::from_values(bwd_outputs))?;

        let mut fwd = GraphBuilder::new();
        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        for node in graph.nodes() {
            if backward.contains(&node.id) {
                continue;
            }
            let new_id = match &node.kind {
                NodeKind::Input(role) => fwd.input(node.name.clone(), *role, node.meta.clone()),
                NodeKind::Operation { args, .. } => {
                    fwd.copy_operation(node, remap_args(args, &remap))
                }
                NodeKind::Output(_) => continue,
            };
            remap.insert(node.id, new_id);
        }
        let mut fwd_outputs = resolve(graph, &remap, joint.forward_outputs())?;
        fwd_outputs.extend(resolve(graph, &remap, &saved)?);
        let forward_graph = fwd.finish(GraphOutput::from_values(fwd_outputs))?;

        log::debug!(
            "default partition: {} backward node(s), {} saved value(s)",
            backward.len(),
            saved.len()
        );
        Ok(Partition {
            forward: forward_graph,
            backward: backward_graph,
            saved: saved.iter().map(|&id| graph.node(id).name.clone()).collect(),
            num_fwd_outputs: joint.num_fwd_outputs(),
        })
    }
}

/// Forward outputs must not depend on tangents; report the offending value instead of
/// building a graph with a dangling reference.
fn resolve(
    graph: &Graph,
    remap: &HashMap<NodeId, NodeId>,
    ids: &[NodeId],
) -> Result<Vec<NodeId>, PartitionError> {
    ids.iter()
        .map(|id| remap.get(id).copied().ok_or_else(|| unknown(graph, *id)))
        .collect()
}

fn unknown(graph: &Graph, id: NodeId) -> PartitionError {
    PartitionError::Graph(GraphError::UnknownValue {
        name: graph.node(id).name.clone(),
    })
}

fn remap_args(args: &Args, remap: &HashMap<NodeId, NodeId>) -> Args {
    args.iter()
        .map(|arg| match arg {
            Arg::Node(id) => Arg::Node(remap[id]),
            Arg::Literal(literal) => Arg::Literal(literal.clone()),
        })
        .collect()
}
