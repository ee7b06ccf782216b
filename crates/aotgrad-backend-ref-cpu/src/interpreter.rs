use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use aotgrad::graph::{Arg, Literal, NodeKind};
use aotgrad::{Executable, Graph, GraphCompiler, TensorValue};

use crate::ops;
use crate::tensor::HostTensor;

/// Runs `graph` on `inputs`, binding inputs positionally in graph order.
///
/// Values are released after their last use, so peak memory follows the graph's liveness
/// rather than its length.
pub fn evaluate(graph: &Graph, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
    let num_inputs = graph.num_inputs();
    if num_inputs != inputs.len() {
        bail!("graph takes {num_inputs} input(s), got {}", inputs.len());
    }

    let mut remaining_uses: Vec<usize> = vec![0; graph.len()];
    for node in graph.nodes() {
        for arg in node.node_args() {
            remaining_uses[arg.index()] += 1;
        }
    }

    let mut values: Vec<Option<HostTensor>> = vec![None; graph.len()];
    let mut next_input = inputs.iter();
    for node in graph.nodes() {
        match &node.kind {
            NodeKind::Input(_) => {
                let input = next_input
                    .next()
                    .ok_or_else(|| anyhow!("missing value for input `{}`", node.name))?;
                if let Some(meta) = &node.meta {
                    if meta.shape != input.shape() {
                        bail!(
                            "input `{}` expects shape {:?}, got {:?}",
                            node.name,
                            meta.shape,
                            input.shape()
                        );
                    }
                }
                values[node.id.index()] = Some(input.clone().with_requires_grad(false));
            }
            NodeKind::Operation { op, args } => {
                let mut operands: Vec<&HostTensor> = Vec::with_capacity(args.len());
                let mut literals: Vec<Literal> = Vec::new();
                for arg in args {
                    match arg {
                        Arg::Node(id) => operands.push(values[id.index()].as_ref().ok_or_else(
                            || anyhow!("`{}` reads a released value", node.name),
                        )?),
                        Arg::Literal(literal) => literals.push(literal.clone()),
                    }
                }
                let result = ops::execute(op.as_str(), &operands, &literals)
                    .with_context(|| format!("evaluating `%{}` ({op})", node.name))?;
                drop(operands);
                for arg in node.node_args() {
                    let uses = &mut remaining_uses[arg.index()];
                    *uses -= 1;
                    if *uses == 0 {
                        values[arg.index()] = None;
                    }
                }
                values[node.id.index()] = Some(result);
            }
            NodeKind::Output(_) => {}
        }
    }

    graph
        .output_values()
        .iter()
        .map(|id| {
            values[id.index()]
                .clone()
                .ok_or_else(|| anyhow!("output `{}` was never computed", graph.node(*id).name))
        })
        .collect()
}

struct InterpretedGraph {
    graph: Graph,
}

impl Executable<HostTensor> for InterpretedGraph {
    fn run(&self, args: &[HostTensor]) -> Result<Vec<HostTensor>> {
        evaluate(&self.graph, args)
    }
}

/// "Compiles" a graph by validating it against the reference kernels; execution interprets
/// the graph node by node.
#[derive(Debug, Default)]
pub struct InterpreterCompiler {
    compilations: AtomicUsize,
}

impl InterpreterCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of graphs compiled so far.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

impl GraphCompiler<HostTensor> for InterpreterCompiler {
    fn name(&self) -> &str {
        "ref-cpu-interpreter"
    }

    fn compile(
        &self,
        graph: &Graph,
        example_args: &[HostTensor],
    ) -> Result<Box<dyn Executable<HostTensor>>> {
        if graph.num_inputs() != example_args.len() {
            bail!(
                "graph takes {} input(s), {} example argument(s) given",
                graph.num_inputs(),
                example_args.len()
            );
        }
        for (node, example) in graph.inputs().zip(example_args) {
            if let Some(meta) = &node.meta {
                if meta.shape != example.shape() {
                    bail!(
                        "example for `{}` has shape {:?}, graph expects {}",
                        node.name,
                        example.shape(),
                        meta
                    );
                }
            }
        }
        if let Some(node) = graph
            .operations()
            .find(|node| node.op().is_some_and(|op| !ops::is_supported(op.as_str())))
        {
            let op = node.op().map(|op| op.as_str()).unwrap_or_default();
            bail!("`%{}` uses `{op}`, which has no reference kernel", node.name);
        }
        self.compilations.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "interpreter compiled a graph with {} node(s)",
            graph.len()
        );
        Ok(Box::new(InterpretedGraph {
            graph: graph.clone(),
        }))
    }
}
