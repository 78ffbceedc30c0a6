use thiserror::Error;

/// Errors raised while decoding an inbound envelope.
///
/// The display text is what the offending peer receives in its `error` envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not valid JSON, or a recognised envelope is missing or mistypes a field.
    #[error("{0}")]
    Malformed(#[from] serde_json::Error),

    /// A binary frame that is not UTF-8 text.
    #[error("frame is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    /// A coordinate that is not a finite number.
    #[error("{field} must be a finite number")]
    NonFiniteCoordinate { field: &'static str },

    /// A search radius that is negative or not a finite number.
    #[error("radius must be a non-negative number of meters, got {0}")]
    InvalidRadius(f64),
}
