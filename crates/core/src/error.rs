//! Item-level error model.

use thiserror::Error;

/// Result type used when decoding or encoding queue payloads.
pub type ItemResult<T> = Result<T, ItemError>;

/// Failure to turn a raw queue payload into a typed item (or back).
///
/// These are never retried: a payload that fails to decode once will fail
/// the same way on every subsequent attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ItemError {
    /// The payload is not a JSON object.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The payload has no `id` (or it is neither a string nor an integer).
    #[error("payload has no usable `id` field")]
    MissingId,

    /// A worker-managed metadata field has the wrong type.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Serializing an item back to JSON failed.
    #[error("encoding failed: {0}")]
    Encode(String),
}

impl ItemError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
