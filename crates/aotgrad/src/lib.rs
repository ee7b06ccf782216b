//! Ahead-of-time autograd core: joint-graph partitioning and signature-keyed compile caching.
//!
//! A traced joint graph computes a function's outputs and the gradients of its inputs in one
//! piece. [`partition`] splits it into a forward and a backward graph and decides which
//! intermediates cross between them. [`dispatch::AotFunction`] ties an external tracer, the
//! selected partitioner and pluggable compilers together behind a [`cache::CompileCache`], so
//! calls with an already seen signature skip tracing, partitioning and compilation.

pub mod cache;
pub mod compile;
pub mod dispatch;
mod env;
pub mod error;
pub mod graph;
pub mod partition;
pub mod profiling;
pub mod signature;
pub mod trace;
pub mod tree;
pub mod value;

pub use cache::{CacheKey, CompileCache, FnId};
pub use compile::{Compilers, Executable, GraphCompiler};
pub use dispatch::{AotFunction, AotOptions, AotOutput, CompiledUnit, GradFn, UnitCache};
pub use error::ConfigError;
pub use graph::{Graph, GraphBuilder, JointGraph, NodeId};
pub use partition::{Partition, PartitionError, Partitioner, PartitionerKind, RecomputePolicy};
pub use signature::{Signature, SignatureScheme, StaticShapeScheme};
pub use trace::{JointRequest, JointTracer, TracedJoint};
pub use tree::{CallArgs, OutputSpec, Tree, TreeSpec};
pub use value::TensorValue;
