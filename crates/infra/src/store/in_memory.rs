//! In-memory message store for tests/dev.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};

use kurisu_core::{AnalysisJob, RecordId, analysis_text};

use super::{CandidateQuery, MessageStore, StoreError, StoreResult};

/// Records keyed by a zero-padded hex id, so key order is insertion order
/// (like ObjectIds).
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<BTreeMap<RecordId, Map<String, JsonValue>>>,
    next_id: AtomicU64,
    insert_attempts: Mutex<Vec<usize>>,
    candidate_queries: AtomicUsize,
    failing_inserts: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Fail the next `count` calls to `insert_many`.
    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Fail every call to `insert_many` from now on.
    pub fn fail_all_inserts(&self) {
        self.failing_inserts.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Seed a record directly, bypassing `insert_many` bookkeeping.
    pub fn seed(&self, record: JsonValue) -> RecordId {
        let id = self.allocate_id();
        let fields = record.as_object().cloned().unwrap_or_default();
        self.records.write().unwrap().insert(id.clone(), fields);
        id
    }

    /// Batch sizes of every `insert_many` call, failed ones included.
    pub fn insert_attempts(&self) -> Vec<usize> {
        self.insert_attempts.lock().unwrap().clone()
    }

    pub fn candidate_queries(&self) -> usize {
        self.candidate_queries.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<(RecordId, Map<String, JsonValue>)> {
        let records = self.records.read().unwrap();
        records
            .iter()
            .map(|(id, fields)| (id.clone(), fields.clone()))
            .collect()
    }

    pub fn get(&self, id: &RecordId) -> Option<Map<String, JsonValue>> {
        self.records.read().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    fn allocate_id(&self) -> RecordId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        RecordId::from(format!("{n:024x}"))
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("in-memory store unavailable".into()));
        }
        Ok(())
    }

    fn take_insert_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| match remaining {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }

    async fn insert_many(&self, records: Vec<JsonValue>) -> StoreResult<Vec<RecordId>> {
        self.insert_attempts.lock().unwrap().push(records.len());
        self.check_available()?;
        if self.take_insert_failure() {
            return Err(StoreError::Write("injected insert failure".into()));
        }

        let mut ids = Vec::with_capacity(records.len());
        let mut stored = self.records.write().unwrap();
        for record in records {
            let JsonValue::Object(fields) = record else {
                return Err(StoreError::Write("record is not a JSON object".into()));
            };
            let id = self.allocate_id();
            stored.insert(id.clone(), fields);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn find_candidates(
        &self,
        query: &CandidateQuery,
        limit: usize,
    ) -> StoreResult<Vec<AnalysisJob>> {
        self.check_available()?;
        self.candidate_queries.fetch_add(1, Ordering::SeqCst);

        let records = self.records.read().unwrap();
        let candidates = records
            .iter()
            .filter(|(id, _)| query.after.as_ref().is_none_or(|after| *id > after))
            .filter_map(|(id, fields)| {
                analysis_text(fields).map(|text| AnalysisJob::new(id.clone(), text))
            })
            .take(limit)
            .collect();
        Ok(candidates)
    }

    async fn update_annotation(&self, id: &RecordId, fields: JsonValue) -> StoreResult<()> {
        self.check_available()?;
        let mut records = self.records.write().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::InvalidId(id.to_string()))?;
        record.insert("sentiment".to_string(), fields);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(text: &str) -> JsonValue {
        json!({"_": "Message", "chat": {"type": "ChatType.GROUP"}, "text": text})
    }

    #[tokio::test]
    async fn insert_many_returns_ids_in_order() {
        let store = InMemoryStore::new();
        let ids = store
            .insert_many(vec![json!({"n": 1}), json!({"n": 2})])
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
        assert_eq!(store.get(&ids[1]).unwrap()["n"], json!(2));
    }

    #[tokio::test]
    async fn injected_failures_are_counted_as_attempts() {
        let store = InMemoryStore::new();
        store.fail_next_inserts(1);

        assert!(store.insert_many(vec![json!({})]).await.is_err());
        assert!(store.insert_many(vec![json!({})]).await.is_ok());
        assert_eq!(store.insert_attempts(), vec![1, 1]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn candidates_page_by_id() {
        let store = InMemoryStore::new();
        let first = store.seed(candidate("one"));
        store.seed(json!({"_": "Message", "text": "/help"}));
        let third = store.seed(candidate("three"));

        let page = store
            .find_candidates(&CandidateQuery::default(), 1)
            .await
            .unwrap();
        assert_eq!(page, vec![AnalysisJob::new(first.clone(), "one")]);

        let next = store
            .find_candidates(&CandidateQuery::after(first), 10)
            .await
            .unwrap();
        assert_eq!(next, vec![AnalysisJob::new(third, "three")]);
    }

    #[tokio::test]
    async fn annotated_records_stop_being_candidates() {
        let store = InMemoryStore::new();
        let id = store.seed(candidate("hello"));

        store
            .update_annotation(&id, json!({"positive": 0.9}))
            .await
            .unwrap();

        let page = store
            .find_candidates(&CandidateQuery::default(), 10)
            .await
            .unwrap();
        assert!(page.is_empty());
    }
}
