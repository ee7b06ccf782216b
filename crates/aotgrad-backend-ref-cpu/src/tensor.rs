use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use aotgrad::graph::DType;
use aotgrad::TensorValue;

/// Dense, row-major f32 host tensor. Data is shared, so clones are cheap.
#[derive(Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Arc<[f32]>,
    requires_grad: bool,
}

impl HostTensor {
    pub fn new(shape: impl Into<Vec<usize>>, data: impl Into<Vec<f32>>) -> Result<Self> {
        let shape = shape.into();
        let data = data.into();
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            bail!(
                "shape {:?} holds {} element(s), got {}",
                shape,
                expected,
                data.len()
            );
        }
        Ok(Self {
            shape,
            data: Arc::from(data),
            requires_grad: false,
        })
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: Arc::from(vec![value]),
            requires_grad: false,
        }
    }

    pub fn full(shape: impl Into<Vec<usize>>, value: f32) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            data: Arc::from(vec![value; len]),
            requires_grad: false,
        }
    }

    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::full(shape, 0.0)
    }

    pub(crate) fn from_parts(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self {
            shape,
            data: Arc::from(data),
            requires_grad: false,
        }
    }

    /// Marks the tensor as a differentiable input.
    pub fn requiring_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.to_vec()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Single element of a tensor with exactly one element.
    pub fn item(&self) -> Option<f32> {
        match &*self.data {
            [value] => Some(*value),
            _ => None,
        }
    }

    /// Largest absolute elementwise difference; `None` when shapes differ.
    pub fn max_abs_diff(&self, other: &HostTensor) -> Option<f32> {
        if self.shape != other.shape {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f32::max),
        )
    }
}

impl TensorValue for HostTensor {
    fn dtype(&self) -> DType {
        DType::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}

impl fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostTensor(f32{:?}", self.shape)?;
        if self.requires_grad {
            f.write_str(", requires_grad")?;
        }
        if self.data.len() <= 8 {
            write!(f, ", {:?}", &*self.data)?;
        }
        f.write_str(")")
    }
}
