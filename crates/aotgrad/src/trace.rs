//! Contract with the external tracer that records joint forward/backward graphs.

use crate::graph::JointGraph;
use crate::tree::TreeSpec;
use crate::value::TensorValue;

/// What the dispatch layer asks a tracer to record.
#[derive(Debug)]
pub struct JointRequest<'a, V> {
    /// Flattened call arguments, used as example inputs.
    pub leaves: &'a [V],
    /// Structure that rebuilds the call arguments from `leaves`.
    pub args_spec: &'a TreeSpec,
}

impl<'a, V: TensorValue> JointRequest<'a, V> {
    pub fn new(leaves: &'a [V], args_spec: &'a TreeSpec) -> Self {
        Self { leaves, args_spec }
    }

    pub fn needs_input_grad(&self) -> Vec<bool> {
        self.leaves.iter().map(TensorValue::requires_grad).collect()
    }

    pub fn num_grad_inputs(&self) -> usize {
        self.leaves.iter().filter(|leaf| leaf.requires_grad()).count()
    }
}

/// Result of tracing a joint function.
#[derive(Debug, Clone)]
pub struct TracedJoint {
    pub joint: JointGraph,
    /// Structure of the user function's return value.
    pub output_spec: TreeSpec,
}

/// Records the joint graph of `func` for the given example inputs.
///
/// The graph must have one primal input per leaf in leaf order, followed by one tangent input
/// per forward output. Its outputs are the forward outputs followed by one gradient per
/// leaf that requires grad, in leaf order. Leaves without `requires_grad` get no gradient
/// output at all. Tracing must be deterministic for equal shapes and dtypes.
pub trait JointTracer<F: ?Sized, V>: Send + Sync {
    fn trace_joint(&self, func: &F, request: &JointRequest<'_, V>) -> anyhow::Result<TracedJoint>;
}
