//! Carving input/output-bounded regions out of a larger graph.

use std::collections::{HashMap, HashSet};

use super::builder::GraphBuilder;
use super::node::{Arg, Args, GraphOutput, InputRole, Node, NodeId, NodeKind};
use super::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Live(NodeId),
    Invalid,
}

/// Builds the closed subgraph that computes `outputs` from `inputs` alone.
///
/// One input node is created per entry of `inputs`, in order, keeping the source name and
/// metadata. Source inputs keep their role; operations promoted to inputs become
/// [`InputRole::Saved`]. Every other source input is invalid, and so is every operation with
/// an invalid argument. The result returns `outputs` as a tuple and only contains operations
/// the output depends on. Inputs are kept even when unused because they form the calling
/// convention of the extracted graph.
///
/// # Panics
/// Panics if an entry of `outputs` depends on an input that is not listed in `inputs`, or if
/// `inputs` names the output node or repeats a node. Both indicate a partitioner bug.
pub fn extract_subgraph(graph: &Graph, inputs: &[NodeId], outputs: &[NodeId]) -> Graph {
    let mut builder = GraphBuilder::new();
    let mut permitted: HashMap<NodeId, NodeId> = HashMap::with_capacity(inputs.len());
    for &id in inputs {
        let source = graph.node(id);
        let role = promoted_role(source)
            .unwrap_or_else(|| panic!("output node `{}` cannot be an input", source.name));
        let new_id = builder.input(source.name.clone(), role, source.meta.clone());
        if permitted.insert(id, new_id).is_some() {
            panic!("input `{}` listed more than once", source.name);
        }
    }

    let mut env: Vec<Slot> = Vec::with_capacity(graph.len());
    for node in graph.nodes() {
        let slot = if let Some(&new_id) = permitted.get(&node.id) {
            Slot::Live(new_id)
        } else {
            match &node.kind {
                NodeKind::Input(_) => Slot::Invalid,
                NodeKind::Output(_) => Slot::Invalid,
                NodeKind::Operation { args, .. } => match remap_args(args, &env) {
                    Some(args) => Slot::Live(builder.copy_operation(node, args)),
                    None => Slot::Invalid,
                },
            }
        };
        env.push(slot);
    }

    let resolved: Vec<NodeId> = outputs
        .iter()
        .map(|&id| match env[id.index()] {
            Slot::Live(new_id) => new_id,
            Slot::Invalid => panic!(
                "output `{}` is not computable from the permitted inputs",
                graph.node(id).name
            ),
        })
        .collect();

    let staged = builder
        .finish(GraphOutput::Tuple(resolved))
        .unwrap_or_else(|err| panic!("extracted graph is malformed: {err}"));
    eliminate_dead_code(&staged)
}

/// Role a node takes when it becomes an input of a derived graph: inputs keep theirs and
/// operations become saved values. Output nodes cannot be promoted.
pub(crate) fn promoted_role(node: &Node) -> Option<InputRole> {
    match &node.kind {
        NodeKind::Input(role) => Some(*role),
        NodeKind::Operation { .. } => Some(InputRole::Saved),
        NodeKind::Output(_) => None,
    }
}

fn remap_args(args: &Args, env: &[Slot]) -> Option<Args> {
    let mut mapped = Args::with_capacity(args.len());
    for arg in args {
        match arg {
            Arg::Node(id) => match env[id.index()] {
                Slot::Live(new_id) => mapped.push(Arg::Node(new_id)),
                Slot::Invalid => return None,
            },
            Arg::Literal(literal) => mapped.push(Arg::Literal(literal.clone())),
        }
    }
    Some(mapped)
}

/// Drops every operation the output does not transitively depend on. Inputs and the output
/// node always survive, and the relative order of the remaining nodes is preserved.
pub fn eliminate_dead_code(graph: &Graph) -> Graph {
    let mut live: HashSet<NodeId> = HashSet::with_capacity(graph.len());
    let mut worklist: Vec<NodeId> = graph.output_values().to_vec();
    while let Some(id) = worklist.pop() {
        if !live.insert(id) {
            continue;
        }
        worklist.extend(graph.node(id).node_args());
    }

    let mut builder = GraphBuilder::new();
    let mut remap: HashMap<NodeId, NodeId> = HashMap::with_capacity(live.len());
    for node in graph.nodes() {
        match &node.kind {
            NodeKind::Input(role) => {
                let new_id = builder.input(node.name.clone(), *role, node.meta.clone());
                remap.insert(node.id, new_id);
            }
            NodeKind::Operation { args, .. } if live.contains(&node.id) => {
                let args: Args = args
                    .iter()
                    .map(|arg| match arg {
                        Arg::Node(id) => Arg::Node(remap[id]),
                        Arg::Literal(literal) => Arg::Literal(literal.clone()),
                    })
                    .collect();
                let new_id = builder.copy_operation(node, args);
                remap.insert(node.id, new_id);
            }
            NodeKind::Operation { .. } | NodeKind::Output(_) => {}
        }
    }

    let output = match graph.output() {
        GraphOutput::Single(id) => GraphOutput::Single(remap[id]),
        GraphOutput::Tuple(ids) => GraphOutput::Tuple(ids.iter().map(|id| remap[id]).collect()),
    };
    let removed = graph.len() - builder.len() - 1;
    if removed > 0 {
        log::trace!("dce removed {removed} operation(s)");
    }
    builder
        .finish(output)
        .unwrap_or_else(|err| panic!("dead-code elimination broke graph invariants: {err}"))
}
