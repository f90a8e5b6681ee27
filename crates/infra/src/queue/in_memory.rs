//! In-memory queue for tests/dev.
//!
//! Mirrors the Redis list/set semantics the pipeline relies on and adds fault
//! injection so outage and routing-failure paths can be exercised.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{MessageQueue, Popped, QueueError, QueueResult};

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    unavailable: bool,
    failing_pushes: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    pushed: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every operation fails with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Make pushes to `queue` fail with a connection error.
    pub fn fail_pushes_to(&self, queue: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_pushes
            .insert(queue.to_string());
    }

    /// Payloads currently in `queue`, oldest first.
    pub fn items(&self, queue: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .lists
            .get(queue)
            .map(|list| list.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.lists.get(queue).map_or(0, VecDeque::len)
    }

    pub fn members(&self, set: &str) -> HashSet<String> {
        let state = self.state.lock().unwrap();
        state.sets.get(set).cloned().unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> QueueResult<T> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(QueueError::Connection("in-memory queue unavailable".into()));
        }
        Ok(f(&mut state))
    }

    fn push_front(&self, queue: &str, payloads: Vec<String>) -> QueueResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.unavailable || state.failing_pushes.contains(queue) {
                return Err(QueueError::Connection(format!("push to {queue} refused")));
            }
            let list = state.lists.entry(queue.to_string()).or_default();
            for payload in payloads {
                list.push_front(payload);
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    fn try_pop(&self, queues: &[&str]) -> QueueResult<Option<Popped>> {
        self.with_state(|state| {
            queues.iter().find_map(|name| {
                state
                    .lists
                    .get_mut(*name)
                    .and_then(VecDeque::pop_back)
                    .map(|payload| Popped {
                        queue: name.to_string(),
                        payload,
                    })
            })
        })
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn ping(&self) -> QueueResult<()> {
        self.with_state(|_| ())
    }

    async fn push(&self, queue: &str, payload: String) -> QueueResult<()> {
        self.push_front(queue, vec![payload])
    }

    async fn push_many(&self, queue: &str, payloads: Vec<String>) -> QueueResult<()> {
        self.push_front(queue, payloads)
    }

    async fn blocking_pop(
        &self,
        queues: &[&str],
        timeout: Duration,
    ) -> QueueResult<Option<Popped>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent push is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.try_pop(queues)? {
                return Ok(Some(popped));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn pop_many(&self, queue: &str, count: usize) -> QueueResult<Vec<String>> {
        self.with_state(|state| {
            let Some(list) = state.lists.get_mut(queue) else {
                return Vec::new();
            };
            let take = count.min(list.len());
            (0..take).filter_map(|_| list.pop_back()).collect()
        })
    }

    async fn add_to_set(&self, set: &str, ids: &[String]) -> QueueResult<()> {
        self.with_state(|state| {
            state
                .sets
                .entry(set.to_string())
                .or_default()
                .extend(ids.iter().cloned());
        })
    }

    async fn are_members(&self, set: &str, ids: &[String]) -> QueueResult<Vec<bool>> {
        self.with_state(|state| {
            let members = state.sets.get(set);
            ids.iter()
                .map(|id| members.is_some_and(|m| m.contains(id)))
                .collect()
        })
    }

    async fn remove_from_set(&self, set: &str, ids: &[String]) -> QueueResult<()> {
        self.with_state(|state| {
            if let Some(members) = state.sets.get_mut(set) {
                for id in ids {
                    members.remove(id);
                }
            }
        })
    }
}
