//! Reference collaborators for `aotgrad`: f32 host tensors, a recording tracer with
//! reverse-mode differentiation, and an interpreter that stands in for a graph compiler.

mod interpreter;
pub mod ops;
mod tensor;
pub mod trace;

use std::sync::Arc;

use aotgrad::{AotFunction, AotOptions, CallArgs, Compilers, ConfigError, Tree, UnitCache};

pub use interpreter::{evaluate, InterpreterCompiler};
pub use tensor::HostTensor;
pub use trace::{RefTracer, Sym, TraceContext};

/// Wraps `func` with the reference tracer, one interpreter for both directions and a
/// private compile cache.
pub fn aot_function<F>(
    func: F,
    options: AotOptions,
) -> Result<AotFunction<F, HostTensor>, ConfigError>
where
    F: Fn(&mut TraceContext, CallArgs<Sym>) -> anyhow::Result<Tree<Sym>> + 'static,
{
    AotFunction::new(
        func,
        Arc::new(RefTracer),
        Compilers::shared(Arc::new(InterpreterCompiler::new())),
        UnitCache::shared(),
        options,
    )
}
