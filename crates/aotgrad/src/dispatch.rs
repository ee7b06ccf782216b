//! Compiled, differentiable wrappers around user functions.
//!
//! ```text
//! call(args) ─ flatten ─ CacheKey ─┬─ hit ──────────────────────────────┐
//!                                  └─ miss: trace ─ partition ─ compile ├─ forward ─ AotOutput
//!                                           (inside the cache lock)     │
//! AotOutput.grad_fn.backward(grads) ─ saved ++ grads ─ backward ─ one slot per leaf
//! ```
//!
//! Each cache entry is a [`CompiledUnit`] that moves from uncompiled to compiled exactly once.
//! The transition happens inside [`CompileCache::get_or_try_insert_with`], so a unit only
//! becomes visible to other callers after its forward and backward graphs compiled.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use once_cell::sync::OnceCell;

use crate::cache::{CacheKey, CompileCache, FnId};
use crate::compile::{Compilers, Executable};
use crate::error::ConfigError;
use crate::graph::JointGraph;
use crate::partition::{Partitioner, PartitionerKind, RecomputePolicy};
use crate::signature::{SignatureScheme, StaticShapeScheme};
use crate::trace::{JointRequest, JointTracer};
use crate::tree::{CallArgs, OutputSpec, Tree, TreeSpec};
use crate::value::TensorValue;

static NEXT_FN_ID: AtomicU64 = AtomicU64::new(1);

pub type UnitCache<V> = CompileCache<Arc<CompiledUnit<V>>>;

#[derive(Clone)]
pub struct AotOptions {
    pub partitioner: PartitionerKind,
    pub recompute: RecomputePolicy,
    pub scheme: Arc<dyn SignatureScheme>,
    /// Log joint, forward and backward graphs at `debug` level on every compilation.
    pub dump_graphs: bool,
}

impl AotOptions {
    /// Defaults with `AOTGRAD_PARTITIONER` and `AOTGRAD_DUMP_GRAPHS` applied.
    ///
    /// This is the only place the environment is read. An unknown partitioner name is an
    /// error here rather than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Some(value) = crate::env::partitioner_override() {
            options.partitioner = value.parse()?;
        }
        options.dump_graphs = crate::env::dump_graphs_enabled();
        Ok(options)
    }

    pub fn with_partitioner(mut self, partitioner: PartitionerKind) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn with_recompute(mut self, policy: RecomputePolicy) -> Self {
        self.recompute = policy;
        self
    }

    pub fn with_scheme(mut self, scheme: Arc<dyn SignatureScheme>) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_dump_graphs(mut self, enabled: bool) -> Self {
        self.dump_graphs = enabled;
        self
    }
}

/// Built-in defaults; the environment is ignored, see [`AotOptions::from_env`].
impl Default for AotOptions {
    fn default() -> Self {
        Self {
            partitioner: PartitionerKind::Default,
            recompute: RecomputePolicy::default(),
            scheme: Arc::new(StaticShapeScheme),
            dump_graphs: false,
        }
    }
}

impl fmt::Debug for AotOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AotOptions")
            .field("partitioner", &self.partitioner)
            .field("recompute", &self.recompute)
            .field("scheme", &self.scheme.tag())
            .field("dump_graphs", &self.dump_graphs)
            .finish()
    }
}

struct CompiledState<V> {
    forward: Box<dyn Executable<V>>,
    backward: Box<dyn Executable<V>>,
    num_outputs: usize,
    needs_input_grad: Vec<bool>,
    output_spec: OutputSpec,
    saved: Vec<String>,
}

/// Compiled forward/backward pair for one cache key.
pub struct CompiledUnit<V> {
    state: OnceCell<CompiledState<V>>,
}

impl<V> Default for CompiledUnit<V> {
    fn default() -> Self {
        Self {
            state: OnceCell::new(),
        }
    }
}

impl<V> CompiledUnit<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_compiled(&self) -> bool {
        self.state.get().is_some()
    }

    /// Names of the values the forward graph hands to the backward graph.
    pub fn saved_names(&self) -> Option<&[String]> {
        self.state.get().map(|state| state.saved.as_slice())
    }

    pub fn num_outputs(&self) -> Option<usize> {
        self.state.get().map(|state| state.num_outputs)
    }

    fn state(&self) -> Result<&CompiledState<V>> {
        self.state
            .get()
            .ok_or_else(|| anyhow!("compiled unit used before its first compilation"))
    }

    /// Runs the forward graph, compiling first if needed. The compilation already executes
    /// the forward graph once, and those outputs are returned instead of running it again.
    fn run_forward(
        &self,
        leaves: &[V],
        compile: impl FnOnce() -> Result<(CompiledState<V>, Vec<V>)>,
    ) -> Result<Vec<V>> {
        let mut first_outputs = None;
        let state = self.state.get_or_try_init(|| {
            let (state, outputs) = compile()?;
            first_outputs = Some(outputs);
            Ok::<_, anyhow::Error>(state)
        })?;
        match first_outputs {
            Some(outputs) => Ok(outputs),
            None => state.forward.run(leaves),
        }
    }
}

/// Result of one call: the user-shaped output plus the handle that runs backward.
pub struct AotOutput<V> {
    pub result: Tree<V>,
    pub grad_fn: GradFn<V>,
}

impl<V> AotOutput<V> {
    pub fn into_parts(self) -> (Tree<V>, GradFn<V>) {
        (self.result, self.grad_fn)
    }
}

/// Saved context of one forward call. [`GradFn::backward`] consumes it; dropping the handle
/// without calling backward releases the saved values as well.
pub struct GradFn<V> {
    unit: Arc<CompiledUnit<V>>,
    saved: Vec<V>,
}

impl<V: TensorValue> GradFn<V> {
    pub fn num_saved(&self) -> usize {
        self.saved.len()
    }

    pub fn saved_nbytes(&self) -> u64 {
        self.saved.iter().map(TensorValue::nbytes).sum()
    }

    /// Runs the backward graph on `grads`, one per flattened output.
    ///
    /// Returns one slot per flattened input leaf in input order; leaves that did not require
    /// grad get `None`.
    pub fn backward(self, grads: Vec<V>) -> Result<Vec<Option<V>>> {
        let state = self.unit.state()?;
        if grads.len() != state.num_outputs {
            bail!(
                "backward expects {} output gradient(s), got {}",
                state.num_outputs,
                grads.len()
            );
        }
        let mut args = self.saved;
        args.extend(grads);
        let computed = state.backward.run(&args)?;
        drop(args);

        let expected = state.needs_input_grad.iter().filter(|&&needs| needs).count();
        if computed.len() != expected {
            bail!(
                "backward graph returned {} gradient(s) for {} differentiable input(s)",
                computed.len(),
                expected
            );
        }
        let mut computed = computed.into_iter();
        Ok(state
            .needs_input_grad
            .iter()
            .map(|&needs| if needs { computed.next() } else { None })
            .collect())
    }
}

/// A user function compiled ahead of time for every argument signature it is called with.
pub struct AotFunction<F, V> {
    id: FnId,
    func: F,
    tracer: Arc<dyn JointTracer<F, V>>,
    compilers: Compilers<V>,
    partitioner: Arc<dyn Partitioner>,
    cache: Arc<UnitCache<V>>,
    options: AotOptions,
}

impl<F, V: TensorValue> AotFunction<F, V> {
    /// Wraps `func`. The partitioner is built here, so configuration errors surface before
    /// any tracing happens.
    pub fn new(
        func: F,
        tracer: Arc<dyn JointTracer<F, V>>,
        compilers: Compilers<V>,
        cache: Arc<UnitCache<V>>,
        options: AotOptions,
    ) -> Result<Self, ConfigError> {
        let partitioner = options.partitioner.build(options.recompute.clone())?;
        let id = FnId(NEXT_FN_ID.fetch_add(1, Ordering::Relaxed));
        log::debug!(
            "wrapped {id} with {} partitioner and {} signatures",
            partitioner.name(),
            options.scheme.tag()
        );
        Ok(Self {
            id,
            func,
            tracer,
            compilers,
            partitioner,
            cache,
            options,
        })
    }

    pub fn id(&self) -> FnId {
        self.id
    }

    pub fn options(&self) -> &AotOptions {
        &self.options
    }

    /// Number of distinct compiled signatures in the shared cache.
    pub fn num_compiled(&self) -> usize {
        self.cache.size()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn call(&self, args: CallArgs<V>) -> Result<AotOutput<V>> {
        let (leaves, args_spec) = args.flatten();
        let key = CacheKey::derive(self.id, self.options.scheme.as_ref(), &leaves);

        let mut fresh: Option<Vec<V>> = None;
        let unit = self.cache.get_or_try_insert_with(key, || -> Result<_> {
            let unit = Arc::new(CompiledUnit::new());
            let outputs = unit.run_forward(&leaves, || self.compile(&leaves, &args_spec))?;
            fresh = Some(outputs);
            Ok(unit)
        })?;
        let mut outputs = match fresh {
            Some(outputs) => outputs,
            None => unit.run_forward(&leaves, || self.compile(&leaves, &args_spec))?,
        };

        let state = unit.state()?;
        if outputs.len() != state.num_outputs + state.saved.len() {
            bail!(
                "forward returned {} value(s), expected {} output(s) and {} saved",
                outputs.len(),
                state.num_outputs,
                state.saved.len()
            );
        }
        let saved = outputs.split_off(state.num_outputs);
        let result = state.output_spec.reconstruct(outputs)?;
        Ok(AotOutput {
            result,
            grad_fn: GradFn {
                unit: Arc::clone(&unit),
                saved,
            },
        })
    }

    fn compile(&self, leaves: &[V], args_spec: &TreeSpec) -> Result<(CompiledState<V>, Vec<V>)> {
        let _scope = crate::profiling::compile_scope("aot::compile");
        let request = JointRequest::new(leaves, args_spec);
        let traced = {
            let _scope = crate::profiling::compile_scope("aot::trace_joint");
            self.tracer.trace_joint(&self.func, &request)?
        };
        let needs_input_grad = request.needs_input_grad();
        check_joint_arity(&traced.joint, leaves.len(), request.num_grad_inputs())?;

        let output_spec = OutputSpec::classify(&traced.output_spec);
        if output_spec.num_leaves() != traced.joint.num_fwd_outputs() {
            bail!(
                "traced output has {} leaves, joint graph returns {} forward output(s)",
                output_spec.num_leaves(),
                traced.joint.num_fwd_outputs()
            );
        }
        if self.options.dump_graphs {
            log::debug!("{} joint graph:\n{}", self.id, traced.joint.graph());
        }

        let partition = {
            let _scope = crate::profiling::compile_scope("aot::partition");
            self.partitioner.partition(&traced.joint)?
        };
        if self.options.dump_graphs {
            log::debug!("{} forward graph:\n{}", self.id, partition.forward);
            log::debug!("{} backward graph:\n{}", self.id, partition.backward);
        }

        let forward = self.compilers.forward.compile(&partition.forward, leaves)?;
        let outputs = forward.run(leaves)?;
        let num_outputs = partition.num_fwd_outputs;
        if outputs.len() != num_outputs + partition.num_saved() {
            bail!(
                "compiled forward returned {} value(s), expected {} output(s) and {} saved",
                outputs.len(),
                num_outputs,
                partition.num_saved()
            );
        }
        let saved_bytes: u64 = outputs[num_outputs..].iter().map(TensorValue::nbytes).sum();
        log::info!(
            "{}: saved activation bytes: {} across {} value(s)",
            self.id,
            saved_bytes,
            partition.num_saved()
        );

        let mut backward_args = outputs[num_outputs..].to_vec();
        backward_args.extend_from_slice(&outputs[..num_outputs]);
        let backward = self
            .compilers
            .backward
            .compile(&partition.backward, &backward_args)?;

        let state = CompiledState {
            forward,
            backward,
            num_outputs,
            needs_input_grad,
            output_spec,
            saved: partition.saved,
        };
        Ok((state, outputs))
    }
}

fn check_joint_arity(joint: &JointGraph, num_leaves: usize, num_grad_inputs: usize) -> Result<()> {
    let graph = joint.graph();
    let primals = graph.primal_inputs().len();
    if primals != num_leaves {
        bail!("joint graph has {primals} primal input(s) for {num_leaves} argument leaves");
    }
    let tangents = graph.tangent_inputs().len();
    if tangents != joint.num_fwd_outputs() {
        bail!(
            "joint graph has {tangents} tangent input(s) for {} forward output(s)",
            joint.num_fwd_outputs()
        );
    }
    let grads = joint.backward_outputs().len();
    if grads != num_grad_inputs {
        bail!("joint graph returns {grads} gradient(s) for {num_grad_inputs} differentiable leaves");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_ignore_the_environment() {
        std::env::set_var("AOTGRAD_PARTITIONER", "greedy");
        let options = AotOptions::default();
        assert_eq!(options.partitioner, PartitionerKind::Default);
        assert!(!options.dump_graphs);
        assert_eq!(options.scheme.tag(), "StaticShapeHasher");
        assert!(matches!(
            AotOptions::from_env(),
            Err(ConfigError::UnknownPartitioner(_))
        ));
    }
}
