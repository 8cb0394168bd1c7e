//! Error type shared by every varformer crate.

/// All failures raised by tensor ops, model construction and checkpoint I/O.
#[derive(Debug, thiserror::Error)]
pub enum VarError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("cannot broadcast shapes {a:?} and {b:?}")]
    BroadcastError { a: Vec<usize>, b: Vec<usize> },

    #[error("matmul dimension mismatch: [{m}, {k1}] @ [{k2}, {n}]")]
    MatmulDimMismatch { m: usize, k1: usize, k2: usize, n: usize },

    #[error("axis {axis} out of range for tensor with {ndim} dimensions")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("cannot reshape {from:?} into {to:?}")]
    InvalidReshape { from: Vec<usize>, to: Vec<isize> },

    #[error("index {index} out of range for dimension of size {size}")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("expected a single-element tensor, got shape {0:?}")]
    NotScalar(Vec<usize>),

    /// Invalid model configuration, detected while building.
    #[error("configuration error: {0}")]
    Config(String),

    /// A variant name that has no entry in its registry namespace.
    #[error("unknown {namespace} variant '{name}'")]
    UnknownVariant { namespace: &'static str, name: String },

    /// A caller broke a component's input contract.
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VarError {
    pub fn config(msg: impl Into<String>) -> Self {
        VarError::Config(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        VarError::Contract(msg.into())
    }

    /// Whether this error was raised by configuration validation or variant lookup.
    pub fn is_config_error(&self) -> bool {
        matches!(self, VarError::Config(_) | VarError::UnknownVariant { .. })
    }
}
