use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::Refinement;
use crate::error::ConfigError;
use crate::graph::OpTag;

const POINTWISE_OPS: &[&str] = &[
    "add", "sub", "div", "atan2", "mul", "max", "min", "pow", "remainder", "fmod", "and", "or",
    "xor", "lshift", "rshift", "eq", "ne", "ge", "gt", "le", "lt", "abs", "bitwise_not", "ceil",
    "floor", "frac", "neg", "relu", "relu_backward", "round", "silu", "trunc", "log", "log10",
    "log1p", "log2", "lgamma", "exp", "expm1", "erf", "erfc", "cos", "acos", "cosh", "sin",
    "asin", "sinh", "tan", "atan", "tanh", "tanh_backward", "atanh", "sqrt", "rsqrt",
    "reciprocal", "sigmoid", "sigmoid_backward", "softplus", "threshold", "threshold_backward",
    "clamp", "where", "lerp", "addcmul", "gelu", "gelu_backward",
];

const REDUCTION_OPS: &[&str] = &[
    "softmax",
    "softmax_backward",
    "sum",
    "mean",
    "sum_to_size",
    "amax",
];

const NORM_OPS: &[&str] = &[
    "instance_norm",
    "batch_norm",
    "batch_norm_backward",
    "layer_norm",
    "layer_norm_backward",
];

const VIEW_OPS: &[&str] = &[
    "expand",
    "clone",
    "transpose",
    "t",
    "view",
    "permute",
    "squeeze",
    "unsqueeze",
    "reshape",
];

const CAST_OPS: &[&str] = &["to", "type_as", "cast"];

/// Cost model of the min-cut partitioner.
///
/// Operators outside `recomputable` are pinned to the forward region and their results are
/// saved when the backward region needs them. Graph intermediates weigh
/// `intermediate_cost_factor` times their byte size against primal inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecomputePolicy {
    pub recomputable: BTreeSet<String>,
    pub intermediate_cost_factor: u64,
    pub refinement: Refinement,
}

impl Default for RecomputePolicy {
    fn default() -> Self {
        let recomputable = POINTWISE_OPS
            .iter()
            .chain(REDUCTION_OPS)
            .chain(NORM_OPS)
            .chain(VIEW_OPS)
            .chain(CAST_OPS)
            .map(|op| op.to_string())
            .collect();
        Self {
            recomputable,
            intermediate_cost_factor: 2,
            refinement: Refinement::SinglePass,
        }
    }
}

impl RecomputePolicy {
    /// Policy that treats nothing as recomputable.
    pub fn save_everything() -> Self {
        Self {
            recomputable: BTreeSet::new(),
            ..Self::default()
        }
    }

    pub fn with_recomputable<I, S>(mut self, ops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recomputable = ops.into_iter().map(Into::into).collect();
        self
    }

    pub fn mark_recomputable(mut self, op: impl Into<String>) -> Self {
        self.recomputable.insert(op.into());
        self
    }

    pub fn mark_non_recomputable(mut self, op: &str) -> Self {
        self.recomputable.remove(op);
        self
    }

    pub fn with_cost_factor(mut self, factor: u64) -> Result<Self, ConfigError> {
        if factor == 0 {
            return Err(ConfigError::InvalidCostFactor(factor));
        }
        self.intermediate_cost_factor = factor;
        Ok(self)
    }

    pub fn with_refinement(mut self, refinement: Refinement) -> Self {
        self.refinement = refinement;
        self
    }

    pub fn is_recomputable(&self, op: &OpTag) -> bool {
        self.recomputable.contains(op.as_str())
    }
}
