use std::sync::Arc;

use crate::graph::Graph;

/// Runnable artifact produced by a [`GraphCompiler`]. Results come back flat, in the order of
/// the graph's output values, whether or not the graph returns a tuple.
pub trait Executable<V>: Send + Sync {
    fn run(&self, args: &[V]) -> anyhow::Result<Vec<V>>;
}

/// Turns a forward or backward graph into an executable, given example arguments that match
/// the graph's inputs position for position.
pub trait GraphCompiler<V>: Send + Sync {
    fn name(&self) -> &str {
        "compiler"
    }

    fn compile(&self, graph: &Graph, example_args: &[V]) -> anyhow::Result<Box<dyn Executable<V>>>;
}

/// Forward and backward compilers used by one wrapped function.
pub struct Compilers<V> {
    pub forward: Arc<dyn GraphCompiler<V>>,
    pub backward: Arc<dyn GraphCompiler<V>>,
}

impl<V> Clone for Compilers<V> {
    fn clone(&self) -> Self {
        Self {
            forward: Arc::clone(&self.forward),
            backward: Arc::clone(&self.backward),
        }
    }
}

impl<V> Compilers<V> {
    pub fn new(forward: Arc<dyn GraphCompiler<V>>, backward: Arc<dyn GraphCompiler<V>>) -> Self {
        Self { forward, backward }
    }

    /// Uses `compiler` for both directions.
    pub fn shared(compiler: Arc<dyn GraphCompiler<V>>) -> Self {
        Self {
            forward: Arc::clone(&compiler),
            backward: compiler,
        }
    }
}
