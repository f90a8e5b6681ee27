//! Redis-backed queue (lists for queues, sets for dedup markers).
//!
//! - **Queues**: `LPUSH` to enqueue, `BRPOP`/`RPOP` to dequeue (FIFO)
//! - **Dedup markers**: `SADD` / pipelined `SISMEMBER` / `SREM`
//! - **Connections**: established lazily, so a client can be constructed at
//!   startup before Redis is reachable and connected by the ping-with-retry
//!   loop. Blocking pops run on their own connection so they never hold up
//!   commands issued by other tasks sharing this client.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{IntoConnectionInfo, RedisError};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{MessageQueue, Popped, QueueError, QueueResult};

pub struct RedisQueue {
    client: redis::Client,
    commands: Mutex<Option<ConnectionManager>>,
    blocking: Mutex<Option<ConnectionManager>>,
}

impl From<RedisError> for QueueError {
    fn from(e: RedisError) -> Self {
        if e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_io_error()
            || e.is_timeout()
        {
            QueueError::Connection(e.to_string())
        } else {
            QueueError::Command(e.to_string())
        }
    }
}

impl RedisQueue {
    /// Create a client for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// No connection is made here. `password`, when given, overrides any
    /// password embedded in the URL.
    pub fn new(redis_url: &str, password: Option<&str>) -> QueueResult<Self> {
        let mut info = redis_url
            .into_connection_info()
            .map_err(|e| QueueError::Connection(format!("invalid redis url: {e}")))?;
        if let Some(password) = password {
            info.redis.password = Some(password.to_string());
        }
        let client = redis::Client::open(info)
            .map_err(|e| QueueError::Connection(format!("redis client error: {e}")))?;

        Ok(Self {
            client,
            commands: Mutex::new(None),
            blocking: Mutex::new(None),
        })
    }

    async fn connection(&self) -> QueueResult<ConnectionManager> {
        Self::cached(&self.client, &self.commands).await
    }

    async fn blocking_connection(&self) -> QueueResult<ConnectionManager> {
        Self::cached(&self.client, &self.blocking).await
    }

    async fn cached(
        client: &redis::Client,
        slot: &Mutex<Option<ConnectionManager>>,
    ) -> QueueResult<ConnectionManager> {
        let mut slot = slot.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!("redis connection established");
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn push(&self, queue: &str, payload: String) -> QueueResult<()> {
        self.push_many(queue, vec![payload]).await
    }

    #[instrument(skip(self, payloads), fields(count = payloads.len()), err)]
    async fn push_many(&self, queue: &str, payloads: Vec<String>) -> QueueResult<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let _: u64 = redis::cmd("LPUSH")
            .arg(queue)
            .arg(&payloads)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn blocking_pop(
        &self,
        queues: &[&str],
        timeout: Duration,
    ) -> QueueResult<Option<Popped>> {
        let mut conn = self.blocking_connection().await?;
        // BRPOP takes whole seconds on older servers; 0 would block forever.
        let timeout_secs = timeout.as_secs().max(1);
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(queues)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(popped.map(|(queue, payload)| Popped { queue, payload }))
    }

    async fn pop_many(&self, queue: &str, count: usize) -> QueueResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let popped: Option<Vec<String>> = redis::cmd("RPOP")
            .arg(queue)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(popped.unwrap_or_default())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn add_to_set(&self, set: &str, ids: &[String]) -> QueueResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let _: u64 = redis::cmd("SADD")
            .arg(set)
            .arg(ids)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn are_members(&self, set: &str, ids: &[String]) -> QueueResult<Vec<bool>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("SISMEMBER").arg(set).arg(id);
        }
        let members: Vec<bool> = pipe.query_async(&mut conn).await?;
        Ok(members)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn remove_from_set(&self, set: &str, ids: &[String]) -> QueueResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let _: u64 = redis::cmd("SREM")
            .arg(set)
            .arg(ids)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.commands.lock().await.take();
        self.blocking.lock().await.take();
        debug!("redis connections released");
    }
}
