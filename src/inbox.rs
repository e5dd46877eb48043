//! # Inbox delivery
//!
//! Delivers messages by dropping them into per-recipient inbox
//! directories:
//!
//! ```text
//! <root>/<recipient>/<created_at>_<id>.json
//! <root>/<recipient>/archive/...
//! ```
//!
//! File names start with a UTC timestamp, so a plain name sort is
//! oldest-first.  Each file is written next to its final name and
//! renamed into place; whoever reads the inbox never sees a partial
//! file.

use crate::store::StoreError;
use crate::{Message, MessageId};
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

const ARCHIVE_DIR: &str = "archive";

const FILE_NAME_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

#[derive(Debug, Clone)]
pub struct InboxDelivery {
    root: Arc<Path>,
}

impl InboxDelivery {
    #[must_use = "a delivery service does nothing unless used"]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        let root: PathBuf = root.into();
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path { &self.root }

    /// The inbox directory for `recipient`.
    ///
    /// Returns `None` for names that would escape the root: empty
    /// names, `.` and `..`, and anything containing a path separator.
    #[must_use]
    pub fn inbox(&self, recipient: &str) -> Option<PathBuf> { inbox_path(&self.root, recipient) }

    /// Writes `message` into its recipient's inbox.
    ///
    /// Returns `Ok(false)` if the recipient is not a usable directory
    /// name.
    pub async fn write(&self, message: &Message) -> Result<bool, StoreError> {
        write_message(&self.root, message).await
    }

    /// Keeps the newest `keep` messages in `recipient`'s inbox and
    /// moves the rest into its `archive` directory.
    ///
    /// Returns the number of messages archived.
    #[tracing::instrument(skip(self))]
    pub async fn rotate(&self, recipient: &str, keep: usize) -> Result<usize, StoreError> {
        let Some(inbox) = self.inbox(recipient) else {
            return Ok(0);
        };

        let mut entries = match tokio::fs::read_dir(&inbox).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(StoreError::Read { path: inbox, source }),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StoreError::Read {
                path: inbox.clone(),
                source,
            })?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }

        if files.len() <= keep {
            return Ok(0);
        }

        files.sort();
        let stale = files.len() - keep;
        let archive = inbox.join(ARCHIVE_DIR);
        tokio::fs::create_dir_all(&archive)
            .await
            .map_err(|source| StoreError::Write {
                path: archive.clone(),
                source,
            })?;

        for file in &files[..stale] {
            let Some(name) = file.file_name() else {
                continue;
            };
            let target = archive.join(name);
            tokio::fs::rename(file, &target)
                .await
                .map_err(|source| StoreError::Write {
                    path: target.clone(),
                    source,
                })?;
        }

        tracing::info!(archived = stale, kept = keep, "rotated inbox");
        Ok(stale)
    }
}

fn inbox_path(root: &Path, recipient: &str) -> Option<PathBuf> {
    let invalid = recipient.is_empty()
        || recipient == "."
        || recipient == ".."
        || recipient.contains(['/', '\\', '\0']);

    if invalid {
        None
    } else {
        Some(root.join(recipient))
    }
}

async fn write_message(root: &Path, message: &Message) -> Result<bool, StoreError> {
    let Some(inbox) = inbox_path(root, &message.recipient) else {
        tracing::warn!(id = %message.id(), recipient = %message.recipient, "refusing to deliver to an invalid inbox name");
        return Ok(false);
    };

    let serialized =
        serde_json::to_vec_pretty(message).map_err(|source| StoreError::Serialize { source })?;
    let target = write_file(&inbox, &file_stem(message.created_at, message.id()), &serialized).await?;

    tracing::debug!(id = %message.id(), path = %target.display(), "wrote message to inbox");
    Ok(true)
}

/// `<timestamp>_<id>`, with the id percent-encoded so that any id
/// makes a single, flat file name.
pub(crate) fn file_stem(at: DateTime<Utc>, id: &MessageId) -> String {
    format!(
        "{}_{}",
        at.format("%Y%m%dT%H%M%S%.6fZ"),
        utf8_percent_encode(id, FILE_NAME_SET)
    )
}

/// Writes `<dir>/<stem>.json` through a hidden temp file, creating
/// `dir` if needed.
pub(crate) async fn write_file(dir: &Path, stem: &str, contents: &[u8]) -> Result<PathBuf, StoreError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| StoreError::Write {
            path: dir.to_owned(),
            source,
        })?;

    let temp = dir.join(format!(".{stem}.tmp"));
    let target = dir.join(format!("{stem}.json"));

    tokio::fs::write(&temp, contents)
        .await
        .map_err(|source| StoreError::Write {
            path: temp.clone(),
            source,
        })?;
    tokio::fs::rename(&temp, &target)
        .await
        .map_err(|source| StoreError::Write {
            path: target.clone(),
            source,
        })?;

    Ok(target)
}

impl tower::Service<Message> for InboxDelivery {
    type Error = StoreError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;
    type Response = bool;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, message: Message) -> Self::Future {
        let root = Arc::clone(&self.root);
        Box::pin(async move { write_message(&root, &message).await })
    }
}
