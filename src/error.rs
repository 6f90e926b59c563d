//! Error types for the aggregation pipeline

use thiserror::Error;

/// Failures surfaced synchronously to callers of the library.
///
/// Conditions the pipeline absorbs on its own (malformed inbound TLVs, non-positive window
/// sizes, backend shutdown trouble) are logged instead of being returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Sample dimensionality mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Must provide at least 1 sample")]
    EmptyBatch,

    #[error("Malformed AMTLV data field: {0}")]
    MalformedAmtlv(String),

    #[error("Max frame size must be at least {min} bytes, got {actual}")]
    FrameTooSmall { min: usize, actual: usize },

    #[error("No density has been computed yet")]
    ModelNotReady,

    #[error("Density backend failure: {0}")]
    Backend(String),

    #[error("Aggregation has been stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, AggError>;
