//! Queue item: an opaque message payload plus worker-managed retry metadata.
//!
//! The producer owns the schema of the message itself; the worker only reads
//! `id` and manages `retry_count`, `first_attempt_time` and `correlation_id`.
//! Everything else is carried through untouched in `content`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::error::{ItemError, ItemResult};
use crate::id::{CorrelationId, MessageId};

const FIELD_ID: &str = "id";
const FIELD_CORRELATION_ID: &str = "correlation_id";
const FIELD_RETRY_COUNT: &str = "retry_count";
const FIELD_FIRST_ATTEMPT_TIME: &str = "first_attempt_time";

/// A message travelling through the ingestion queues.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    /// Producer-assigned identifier, written back with its original JSON type.
    pub id: MessageId,
    /// Propagated from the producer, generated on first dequeue otherwise.
    pub correlation_id: CorrelationId,
    /// Number of failed persistence attempts so far.
    pub retry_count: u32,
    /// Epoch seconds of the first dequeue. Set once, never overwritten.
    pub first_attempt_time: f64,
    /// Producer-owned message fields, passed through verbatim.
    #[serde(flatten)]
    pub content: Map<String, JsonValue>,
}

impl QueueItem {
    /// Decode a raw queue payload, stamping any missing metadata.
    ///
    /// `now` is used for `first_attempt_time` only when the payload does not
    /// already carry one.
    pub fn from_payload(payload: &str, now: DateTime<Utc>) -> ItemResult<Self> {
        let value: JsonValue =
            serde_json::from_str(payload).map_err(|e| ItemError::malformed(e.to_string()))?;
        Self::from_value(value, now)
    }

    /// Same as [`QueueItem::from_payload`] for an already-parsed JSON value.
    pub fn from_value(value: JsonValue, now: DateTime<Utc>) -> ItemResult<Self> {
        let JsonValue::Object(mut content) = value else {
            return Err(ItemError::malformed("payload is not a JSON object"));
        };

        let id = content
            .remove(FIELD_ID)
            .and_then(MessageId::from_json)
            .ok_or(ItemError::MissingId)?;

        let correlation_id = match content.remove(FIELD_CORRELATION_ID) {
            Some(JsonValue::String(s)) if !s.is_empty() => CorrelationId::from(s),
            None | Some(JsonValue::Null) | Some(JsonValue::String(_)) => {
                CorrelationId::generate()
            }
            Some(other) => {
                return Err(ItemError::invalid_field(
                    FIELD_CORRELATION_ID,
                    format!("expected string, got {other}"),
                ));
            }
        };

        let retry_count = match content.remove(FIELD_RETRY_COUNT) {
            None | Some(JsonValue::Null) => 0,
            Some(JsonValue::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    ItemError::invalid_field(FIELD_RETRY_COUNT, format!("out of range: {n}"))
                })?,
            Some(other) => {
                return Err(ItemError::invalid_field(
                    FIELD_RETRY_COUNT,
                    format!("expected integer, got {other}"),
                ));
            }
        };

        let first_attempt_time = match content.remove(FIELD_FIRST_ATTEMPT_TIME) {
            None | Some(JsonValue::Null) => epoch_seconds(now),
            Some(JsonValue::Number(n)) => n.as_f64().ok_or_else(|| {
                ItemError::invalid_field(FIELD_FIRST_ATTEMPT_TIME, format!("not a float: {n}"))
            })?,
            Some(other) => {
                return Err(ItemError::invalid_field(
                    FIELD_FIRST_ATTEMPT_TIME,
                    format!("expected epoch seconds, got {other}"),
                ));
            }
        };

        Ok(Self {
            id,
            correlation_id,
            retry_count,
            first_attempt_time,
            content,
        })
    }

    /// Record one more failed persistence attempt and return the new count.
    pub fn record_failed_attempt(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    /// `first_attempt_time` as a timestamp (None when it is out of range).
    pub fn first_attempt_at(&self) -> Option<DateTime<Utc>> {
        let millis = (self.first_attempt_time * 1000.0).round();
        if !millis.is_finite() {
            return None;
        }
        DateTime::<Utc>::from_timestamp_millis(millis as i64)
    }

    /// Full record as a JSON object (content plus metadata), as persisted.
    pub fn to_document(&self) -> ItemResult<JsonValue> {
        serde_json::to_value(self).map_err(|e| ItemError::Encode(e.to_string()))
    }

    /// Wire encoding used for the retry and dead-letter queues.
    pub fn to_payload(&self) -> ItemResult<String> {
        serde_json::to_string(self).map_err(|e| ItemError::Encode(e.to_string()))
    }
}

fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}
