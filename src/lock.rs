use crate::store::StoreError;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt as _;

/// An exclusive, advisory lock over a queue file.
///
/// The lock is a file created with `O_EXCL` semantics, holding the
/// pid of the owner.  It is removed by [`ProcessLock::release`], or
/// failing that when the lock is dropped.  A process that dies
/// without dropping the lock leaves the file behind;
/// [`ProcessLock::force_release`] removes it.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    released: bool,
}

impl ProcessLock {
    #[tracing::instrument(skip_all, fields(path))]
    pub async fn acquire<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let path = path.into();
        tracing::Span::current().record("path", tracing::field::display(path.display()));

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Lock {
                    path: path.clone(),
                    source,
                })?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Locked { path });
            }
            Err(source) => return Err(StoreError::Lock { path, source }),
        };

        // From here on the file exists, so going through `Self` makes
        // sure it is cleaned up if writing the pid fails.
        let lock = Self {
            path,
            released: false,
        };
        file.write_all(std::process::id().to_string().as_bytes())
            .await
            .map_err(|source| StoreError::Lock {
                path: lock.path.clone(),
                source,
            })?;
        file.flush().await.map_err(|source| StoreError::Lock {
            path: lock.path.clone(),
            source,
        })?;

        tracing::debug!("acquired process lock");
        Ok(lock)
    }

    /// Releases the lock, removing the lock file.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "released process lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Lock {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Removes a lock file regardless of who holds it.
    ///
    /// Returns `false` if there was no lock to remove.
    pub async fn force_release(path: &Path) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Lock {
                path: path.to_owned(),
                source,
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path { &self.path }
}

impl Drop for ProcessLock {
    // A single blocking unlink; async callers should use `release`.
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Err(error) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %error, "failed to release process lock");
        }
    }
}
