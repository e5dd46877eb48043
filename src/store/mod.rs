//! # Stores
//!
//! A store is the durable half of a queue: it holds the full list of
//! pending messages, in order, and hands it back when a queue is
//! opened.  The queue keeps its own in-memory copy and writes the
//! whole list through [`MessageStore::save`] after every mutation;
//! nothing else should write to a store that a queue owns.
//!
//! Two stores ship with the crate:
//!
//! - [`JsonFileStore`], a single JSON array on disk.  This is the
//!   format the processor binary uses.
//! - [`MemoryStore`], an in-process list, useful for tests and for
//!   embedding a queue without touching the filesystem.
//!
//! Other backends (an append-only log, SQLite, ...) only need
//! `load` and `save`.  The provided `append`, `remove`, and `compact`
//! methods fall back to a full load/save cycle, and can be overridden
//! where the backend can do better.

mod json;
mod memory;

pub use self::json::JsonFileStore;
pub use self::memory::MemoryStore;

use crate::{Message, MessageId};
use std::path::PathBuf;

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// The error for the store.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Loads every persisted message, in queue order.
    ///
    /// A store that has never been written to loads as empty.
    async fn load(&self) -> Result<Vec<Message>, Self::Error>;

    /// Replaces the persisted contents with `messages`.
    async fn save(&self, messages: &[Message]) -> Result<(), Self::Error>;

    /// Appends a single message to the tail.
    async fn append(&self, message: &Message) -> Result<(), Self::Error> {
        let mut messages = self.load().await?;
        messages.push(message.clone());
        self.save(&messages).await
    }

    /// Removes every message whose id is in `ids`, returning how many
    /// were removed.
    async fn remove(&self, ids: &[MessageId]) -> Result<usize, Self::Error> {
        let mut messages = self.load().await?;
        let before = messages.len();
        messages.retain(|message| !ids.contains(message.id()));
        let removed = before - messages.len();

        if removed > 0 {
            self.save(&messages).await?;
        }

        Ok(removed)
    }

    /// Drops delivered messages, returning how many were removed.
    async fn compact(&self) -> Result<usize, Self::Error> {
        let mut messages = self.load().await?;
        let before = messages.len();
        messages.retain(|message| !message.is_delivered());
        let removed = before - messages.len();

        if removed > 0 {
            self.save(&messages).await?;
        }

        Ok(removed)
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize messages: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to acquire lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is held by another process", path.display())]
    Locked { path: PathBuf },
}
