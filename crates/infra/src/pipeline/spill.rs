//! Local JSON-lines file for items that could not be routed to any queue.
//!
//! Each line is `{"queue": <intended queue>, "item": <queue item>}` so the
//! file can be replayed onto the right queue once Redis is back.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use kurisu_core::QueueItem;

#[derive(Debug, thiserror::Error)]
pub enum SpillError {
    #[error("failed to encode spilled item: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write spill file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Serialize)]
struct SpillLine<'a> {
    queue: &'a str,
    item: &'a QueueItem,
}

#[derive(Debug, Clone)]
pub struct SpillFile {
    path: PathBuf,
}

impl SpillFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one item, creating the file if needed.
    pub async fn append(&self, queue: &str, item: &QueueItem) -> Result<(), SpillError> {
        let mut line = serde_json::to_vec(&SpillLine { queue, item })?;
        line.push(b'\n');

        let io_err = |source: std::io::Error| SpillError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}
