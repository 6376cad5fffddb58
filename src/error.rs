use thiserror::Error;

/// Errors surfaced by the sampler and the tensor helpers.
///
/// Every variant is a local precondition violation; nothing here is retried internally.
#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Degenerate distribution: {0}")]
    DegenerateDistribution(String),

    #[error("Unsupported tensor rank {0} (expected 1, 2 or 3)")]
    UnsupportedShape(usize),

    #[error("Constraint lookup for {0:?} returned no allowed tokens")]
    EmptyConstraintSet(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SamplingError>;

/// Shorthand for building an [`SamplingError::InvalidParameter`].
pub(crate) fn invalid(msg: impl Into<String>) -> SamplingError {
    SamplingError::InvalidParameter(msg.into())
}
