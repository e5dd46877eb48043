use super::{MessageStore, StoreError};
use crate::Message;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// A store backed by a single JSON array file.
///
/// Saves are written to a sibling `.tmp` file first, and then renamed
/// over the target, so a reader never observes a half-written array.
/// This does nothing for two processes saving the same file; the last
/// save wins.  See [`ProcessLock`](crate::ProcessLock) for keeping a
/// single writer.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    #[must_use = "a store does nothing unless used"]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self { Self { path: path.into() } }

    #[must_use]
    pub fn path(&self) -> &Path { &self.path }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait::async_trait]
impl MessageStore for JsonFileStore {
    type Error = StoreError;

    /// Loads the queue file.
    ///
    /// A missing or blank file loads as empty.  So does a file that
    /// is not a valid JSON array of messages: the error is logged, and
    /// the contents are left on disk until the next save replaces
    /// them.
    async fn load(&self) -> Result<Vec<Message>, Self::Error> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(vec![]);
        }

        match serde_json::from_slice::<Vec<Message>>(&bytes) {
            Ok(messages) => {
                tracing::debug!(path = %self.path.display(), count = messages.len(), "loaded queue file");
                Ok(messages)
            }
            Err(error) => {
                tracing::error!(
                    path = %self.path.display(),
                    %error,
                    "queue file is corrupt; starting with an empty queue"
                );
                Ok(vec![])
            }
        }
    }

    async fn save(&self, messages: &[Message]) -> Result<(), Self::Error> {
        let serialized = serde_json::to_vec_pretty(messages)
            .map_err(|source| StoreError::Serialize { source })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Write {
                    path: parent.to_owned(),
                    source,
                })?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, serialized)
            .await
            .map_err(|source| StoreError::Write {
                path: temp.clone(),
                source,
            })?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })?;

        Ok(())
    }
}
