//! Identifiers carried through the pipeline.
//!
//! Correlation ids and record ids are string-backed: correlation ids come from
//! the producer verbatim and record ids are whatever the store generated (an
//! ObjectId hex for MongoDB). Message ids keep the producer's JSON value.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Log-correlation identifier propagated from the producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

/// Identifier of a persisted message record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(CorrelationId);
impl_string_newtype!(RecordId);

/// Producer-assigned message id: a non-empty string or an integer.
///
/// Stored and re-queued exactly as received; [`Display`](core::fmt::Display)
/// gives the plain form used in logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MessageId(JsonValue);

impl MessageId {
    /// `None` for anything but a non-empty string or an integer.
    pub fn from_json(value: JsonValue) -> Option<Self> {
        match &value {
            JsonValue::String(s) if !s.is_empty() => Some(Self(value)),
            JsonValue::Number(n) if n.is_i64() || n.is_u64() => Some(Self(value)),
            _ => None,
        }
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.0 {
            JsonValue::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

impl PartialEq<&str> for MessageId {
    fn eq(&self, other: &&str) -> bool {
        self.0.as_str() == Some(*other)
    }
}

impl CorrelationId {
    /// Generate a fresh correlation id (UUIDv7, time-ordered).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}
