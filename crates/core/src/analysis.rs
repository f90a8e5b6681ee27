//! Sentiment analysis jobs and annotations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{ItemError, ItemResult};
use crate::id::RecordId;

/// Chat type value the bot stores for one-to-one conversations.
pub const PRIVATE_CHAT_TYPE: &str = "ChatType.PRIVATE";

/// Event discriminator of plain chat messages.
pub const MESSAGE_EVENT: &str = "Message";

/// Messages starting with this prefix are bot commands and never analyzed.
pub const COMMAND_PREFIX: char = '/';

/// Work item on the analysis queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
    #[serde(rename = "_id")]
    pub id: RecordId,
    pub text: String,
}

impl AnalysisJob {
    pub fn new(id: impl Into<RecordId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }

    pub fn from_payload(payload: &str) -> ItemResult<Self> {
        serde_json::from_str(payload).map_err(|e| ItemError::malformed(e.to_string()))
    }

    pub fn to_payload(&self) -> ItemResult<String> {
        serde_json::to_string(self).map_err(|e| ItemError::Encode(e.to_string()))
    }
}

/// Result of analyzing one text, stored under the record's `sentiment` field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Annotation {
    /// Sentiment label → score (e.g. `positive`, `neutral`, `negative`).
    #[serde(flatten)]
    pub sentiment: BTreeMap<String, f64>,
    /// Sensitive topic → score, already thresholded by the analyzer.
    #[serde(default)]
    pub sensitive_topics: BTreeMap<String, f64>,
}

impl Annotation {
    pub fn to_fields(&self) -> ItemResult<JsonValue> {
        serde_json::to_value(self).map_err(|e| ItemError::Encode(e.to_string()))
    }
}

/// Text to analyze for a stored message record, or `None` when the record is
/// not a candidate.
///
/// A candidate is a plain message from a non-private chat, not sent by a bot,
/// not yet annotated, whose text (or caption) is non-empty and is not a
/// command.
pub fn analysis_text(record: &Map<String, JsonValue>) -> Option<&str> {
    if record.contains_key("sentiment") {
        return None;
    }
    if record.get("_").and_then(JsonValue::as_str) != Some(MESSAGE_EVENT) {
        return None;
    }
    let chat_type = record
        .get("chat")
        .and_then(|chat| chat.get("type"))
        .and_then(JsonValue::as_str);
    if chat_type == Some(PRIVATE_CHAT_TYPE) {
        return None;
    }
    let from_bot = record
        .get("from_user")
        .and_then(|user| user.get("is_bot"))
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    if from_bot {
        return None;
    }

    let non_empty = |key: &str| {
        record
            .get(key)
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
    };
    let text = non_empty("text").or_else(|| non_empty("caption"))?;

    if text.starts_with(COMMAND_PREFIX) {
        return None;
    }
    Some(text)
}
