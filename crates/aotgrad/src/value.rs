use crate::graph::{DType, TensorMeta};

/// Leaf contract for the runtime values that flow through a compiled function.
///
/// Only static properties are inspected here: signatures hash them, the dispatch layer reads
/// `requires_grad` to route gradients and `nbytes` to report saved-activation sizes.
pub trait TensorValue: Clone {
    fn dtype(&self) -> DType;

    fn shape(&self) -> &[usize];

    fn requires_grad(&self) -> bool;

    fn numel(&self) -> u64 {
        self.shape().iter().map(|&dim| dim as u64).product()
    }

    fn nbytes(&self) -> u64 {
        self.numel() * self.dtype().size_in_bytes() as u64
    }

    fn meta(&self) -> TensorMeta {
        TensorMeta::new(self.dtype(), self.shape().to_vec())
    }
}
