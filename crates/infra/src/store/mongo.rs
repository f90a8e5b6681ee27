//! MongoDB-backed message store.
//!
//! The candidate scan mirrors [`kurisu_core::analysis_text`] as an aggregation
//! pipeline so the filtering happens server-side. Every record the pipeline
//! returns has analyzable text, so an empty page means the scan is done.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc, oid::ObjectId};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{ClientOptions, InsertManyOptions};
use mongodb::{Client, Collection};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use kurisu_core::analysis::{COMMAND_PREFIX, MESSAGE_EVENT, PRIVATE_CHAT_TYPE};
use kurisu_core::{AnalysisJob, RecordId};

use super::{CandidateQuery, MESSAGES_COLLECTION, MessageStore, StoreError, StoreResult};

pub struct MongoMessageStore {
    client: Client,
    messages: Collection<Document>,
}

fn is_connection_error(e: &MongoError) -> bool {
    matches!(
        *e.kind,
        ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
    )
}

fn classify(e: MongoError, wrap: fn(String) -> StoreError) -> StoreError {
    if is_connection_error(&e) {
        StoreError::Connection(e.to_string())
    } else {
        wrap(e.to_string())
    }
}

fn parse_object_id(id: &RecordId) -> StoreResult<ObjectId> {
    ObjectId::parse_str(id.as_str()).map_err(|e| StoreError::InvalidId(format!("{id}: {e}")))
}

fn record_id(value: &Bson) -> RecordId {
    match value {
        Bson::ObjectId(oid) => RecordId::from(oid.to_hex()),
        Bson::String(s) => RecordId::from(s.as_str()),
        other => RecordId::from(other.to_string()),
    }
}

impl MongoMessageStore {
    /// Build a client for `url` and select `database`.
    ///
    /// The driver connects lazily; reachability is checked by [`MessageStore::ping`].
    pub async fn new(url: &str, database: &str) -> StoreResult<Self> {
        let options = ClientOptions::parse(url)
            .await
            .map_err(|e| StoreError::Connection(format!("invalid mongodb url: {e}")))?;
        let client = Client::with_options(options)
            .map_err(|e| StoreError::Connection(format!("mongodb client error: {e}")))?;
        let messages = client
            .database(database)
            .collection::<Document>(MESSAGES_COLLECTION);

        Ok(Self { client, messages })
    }

    fn candidate_pipeline(query: &CandidateQuery, limit: usize) -> StoreResult<Vec<Document>> {
        let mut conditions = vec![
            doc! { "chat.type": { "$ne": PRIVATE_CHAT_TYPE } },
            doc! { "_": MESSAGE_EVENT },
            doc! { "sentiment": { "$exists": false } },
            doc! {
                "$or": [
                    { "text": { "$exists": true, "$ne": "" } },
                    { "caption": { "$exists": true, "$ne": "" } },
                ]
            },
            doc! {
                "$or": [
                    { "from_user.is_bot": { "$exists": false } },
                    { "from_user.is_bot": false },
                ]
            },
        ];
        if let Some(after) = &query.after {
            let after = parse_object_id(after)?;
            conditions.push(doc! { "_id": { "$gt": after } });
        }

        let command_pattern = format!("^{COMMAND_PREFIX}");
        Ok(vec![
            doc! { "$match": { "$and": conditions } },
            doc! { "$sort": { "_id": 1 } },
            doc! { "$addFields": { "message_content": message_content() } },
            doc! {
                "$match": {
                    "message_content": {
                        "$type": "string",
                        "$ne": "",
                        "$not": { "$regex": command_pattern },
                    }
                }
            },
            doc! { "$project": { "_id": 1, "text": 1, "caption": 1 } },
            doc! { "$limit": limit as i64 },
        ])
    }
}

/// First non-empty string of `text` and `caption`, as [`candidate_text`] picks it.
fn message_content() -> Document {
    doc! {
        "$cond": [
            {
                "$and": [
                    { "$eq": [{ "$type": "$text" }, "string"] },
                    { "$ne": ["$text", ""] },
                ]
            },
            "$text",
            "$caption",
        ]
    }
}

fn candidate_text(doc: &Document) -> Option<String> {
    let non_empty = |key: &str| doc.get_str(key).ok().filter(|s| !s.is_empty());
    non_empty("text").or_else(|| non_empty("caption")).map(str::to_string)
}

#[async_trait]
impl MessageStore for MongoMessageStore {
    async fn ping(&self) -> StoreResult<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| classify(e, StoreError::Query))?;
        Ok(())
    }

    #[instrument(skip(self, records), fields(batch_size = records.len()), err)]
    async fn insert_many(&self, records: Vec<JsonValue>) -> StoreResult<Vec<RecordId>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let documents = records
            .iter()
            .map(bson::to_document)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Write(format!("record is not a document: {e}")))?;

        let options = InsertManyOptions::builder().ordered(false).build();
        let result = self
            .messages
            .insert_many(documents, options)
            .await
            .map_err(|e| classify(e, StoreError::Write))?;

        let mut inserted: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
        inserted.sort_by_key(|(index, _)| *index);
        Ok(inserted.iter().map(|(_, id)| record_id(id)).collect())
    }

    #[instrument(skip(self), err)]
    async fn find_candidates(
        &self,
        query: &CandidateQuery,
        limit: usize,
    ) -> StoreResult<Vec<AnalysisJob>> {
        let pipeline = Self::candidate_pipeline(query, limit)?;
        let mut cursor = self
            .messages
            .aggregate(pipeline, None)
            .await
            .map_err(|e| classify(e, StoreError::Query))?;

        let mut candidates = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| classify(e, StoreError::Query))?
        {
            let Some(id) = doc.get("_id").map(record_id) else {
                continue;
            };
            match candidate_text(&doc) {
                Some(text) => candidates.push(AnalysisJob::new(id, text)),
                None => debug!(record_id = %id, "candidate without text skipped"),
            }
        }
        Ok(candidates)
    }

    async fn update_annotation(&self, id: &RecordId, fields: JsonValue) -> StoreResult<()> {
        let oid = parse_object_id(id)?;
        let sentiment = bson::to_bson(&fields)
            .map_err(|e| StoreError::Write(format!("annotation is not BSON: {e}")))?;

        self.messages
            .update_one(
                doc! { "_id": oid },
                doc! { "$set": { "sentiment": sentiment } },
                None,
            )
            .await
            .map_err(|e| classify(e, StoreError::Write))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_pages_after_cursor() {
        let after = RecordId::from("65f000000000000000000001");
        let pipeline =
            MongoMessageStore::candidate_pipeline(&CandidateQuery::after(after), 1000).unwrap();

        let first = pipeline[0].get_document("$match").unwrap();
        let conditions = first.get_array("$and").unwrap();
        assert_eq!(conditions.len(), 6);
        assert_eq!(pipeline.last().unwrap().get_i64("$limit").unwrap(), 1000);
    }

    #[test]
    fn pipeline_rejects_non_object_id_cursor() {
        let err = MongoMessageStore::candidate_pipeline(
            &CandidateQuery::after(RecordId::from("not-an-oid")),
            10,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(_)));
    }

    #[test]
    fn pipeline_only_returns_records_with_string_content() {
        let pipeline = MongoMessageStore::candidate_pipeline(&CandidateQuery::default(), 10).unwrap();

        let added = pipeline[2].get_document("$addFields").unwrap();
        assert_eq!(added.get_document("message_content").unwrap(), &message_content());

        let content = pipeline[3]
            .get_document("$match")
            .unwrap()
            .get_document("message_content")
            .unwrap();
        assert_eq!(content.get_str("$type").unwrap(), "string");
        assert_eq!(content.get_str("$ne").unwrap(), "");
        assert_eq!(
            content.get_document("$not").unwrap().get_str("$regex").unwrap(),
            "^/"
        );
    }

    #[test]
    fn empty_text_falls_through_to_a_command_caption() {
        let doc = doc! { "_id": ObjectId::new(), "text": "", "caption": "/cmd" };
        assert_eq!(candidate_text(&doc).as_deref(), Some("/cmd"));

        let content = message_content();
        let branches = content.get_array("$cond").unwrap();
        assert_eq!(branches[1], Bson::String("$text".into()));
        assert_eq!(branches[2], Bson::String("$caption".into()));
    }

    #[test]
    fn caption_is_used_when_text_is_empty() {
        let doc = doc! { "_id": ObjectId::new(), "text": "", "caption": "look" };
        assert_eq!(candidate_text(&doc).as_deref(), Some("look"));
    }
}
