use thiserror::Error;

/// Configuration problems detected while assembling a compiled function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The requested component needs a cargo feature this build was compiled without.
    #[error("partitioner `{partitioner}` requires the `{feature}` feature, which is not enabled")]
    MissingCapability {
        partitioner: &'static str,
        feature: &'static str,
    },
    #[error("unknown partitioner `{0}` (expected `default` or `min-cut`)")]
    UnknownPartitioner(String),
    #[error("intermediate cost factor must be at least 1, got {0}")]
    InvalidCostFactor(u64),
}
