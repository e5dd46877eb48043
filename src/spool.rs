//! # Submission spool
//!
//! While a processor owns a queue file, nobody else may write it.
//! Other producers drop messages into the spool directory instead,
//! one file per message, and the processor moves them into its queue
//! before each batch.
//!
//! Files are written to a temp name and renamed into place, so the
//! processor never reads a partial submission.  A submission is only
//! removed from the spool after the queue has taken it; if the
//! processor dies in between, the next ingest sees an id the queue
//! already holds and just removes the file.

use crate::inbox::{file_stem, write_file};
use crate::store::StoreError;
use crate::Message;
use chrono::Utc;
use std::path::{Path, PathBuf};

const REJECTED_EXTENSION: &str = "rejected";

#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    #[must_use = "a spool does nothing unless used"]
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self { Self { dir: dir.into() } }

    #[must_use]
    pub fn dir(&self) -> &Path { &self.dir }

    /// Drops `message` into the spool, returning the file it was
    /// written to.
    #[tracing::instrument(skip_all, fields(id = %message.id()))]
    pub async fn submit(&self, message: &Message) -> Result<PathBuf, StoreError> {
        let serialized =
            serde_json::to_vec_pretty(message).map_err(|source| StoreError::Serialize { source })?;
        let path = write_file(&self.dir, &file_stem(Utc::now(), message.id()), &serialized).await?;

        tracing::debug!(path = %path.display(), "submitted message to spool");
        Ok(path)
    }

    /// Every pending submission, oldest first.
    ///
    /// Files that do not parse as a message are renamed with a
    /// `.rejected` extension and skipped.
    pub async fn pending(&self) -> Result<Vec<(PathBuf, Message)>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StoreError::Read {
                path: self.dir.clone(),
                source,
            })?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();

        let mut pending = Vec::with_capacity(files.len());
        for path in files {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Picked up by someone else in the meantime.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(StoreError::Read { path, source }),
            };

            match serde_json::from_slice::<Message>(&bytes) {
                Ok(message) => pending.push((path, message)),
                Err(error) => {
                    tracing::error!(path = %path.display(), %error, "rejecting malformed submission");
                    let rejected = path.with_extension(REJECTED_EXTENSION);
                    tokio::fs::rename(&path, &rejected)
                        .await
                        .map_err(|source| StoreError::Write {
                            path: rejected.clone(),
                            source,
                        })?;
                }
            }
        }

        Ok(pending)
    }

    /// Removes a submission once it has been queued.
    pub async fn remove(&self, path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write {
                path: path.to_owned(),
                source,
            }),
        }
    }
}
