//! Error types for mel-infill.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// A tensor's batch size, feature dimension, or hidden size disagrees with
    /// the configured dimensions.
    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    /// An input tensor's dtype differs from the model weights.
    #[error("dtype mismatch in {what}: expected {expected:?}, got {actual:?}")]
    DTypeMismatch {
        what: &'static str,
        expected: candle_core::DType,
        actual: candle_core::DType,
    },

    /// Negative or inconsistent span, or reference frames that do not cover it.
    #[error("invalid span [{left}, {right}]: {reason}")]
    InvalidSpan {
        left: i64,
        right: i64,
        reason: String,
    },

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn shape(
        what: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Error::ShapeMismatch {
            what,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    pub(crate) fn span(left: i64, right: i64, reason: impl Into<String>) -> Self {
        Error::InvalidSpan {
            left,
            right,
            reason: reason.into(),
        }
    }
}
