use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::utils::validation::dataset_extension;

/// A dataset written to the staging area for the lifetime of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub id: String,
    pub path: PathBuf,
    /// Lowercase extension of the uploaded name, empty when it had none
    pub original_extension: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Failed to stage upload at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload exceeds maximum allowed {max} bytes")]
    TooLarge { max: u64 },

    /// The client's body stream failed before the upload was complete
    #[error("Upload stream interrupted: {source}")]
    Upload {
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Streams `reader` into a new uniquely named file, keeping the extension of
    /// `original_filename`.
    async fn stage<'a>(
        &self,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        original_filename: &str,
    ) -> Result<StagedFile, StagingError>;

    /// Deletes a staged file. Releasing a file that is already gone succeeds.
    async fn release(&self, staged: &StagedFile) -> Result<(), StagingError>;
}

/// Staging store backed by a local directory
pub struct LocalStagingStore {
    root: PathBuf,
    max_file_size: u64,
}

impl LocalStagingStore {
    pub fn new(root: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            root: root.into(),
            max_file_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Timestamp prefix for readability, random suffix for uniqueness
    fn generate_id() -> String {
        format!(
            "{}-{}",
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            Uuid::new_v4().simple()
        )
    }

    async fn write_stream<'a>(
        &self,
        path: &Path,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<(u64, String), StagingError> {
        let io_err = |source| StagingError::Io {
            path: path.to_path_buf(),
            source,
        };

        // create_new: an id collision fails instead of clobbering another upload
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(io_err)?;
        // From here on the file is ours to remove on any early exit
        let mut partial = PartialFile::new(path);

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        let mut total_size: u64 = 0;

        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .map_err(|source| StagingError::Upload { source })?;
            if n == 0 {
                break;
            }
            total_size += n as u64;
            if total_size > self.max_file_size {
                return Err(StagingError::TooLarge {
                    max: self.max_file_size,
                });
            }
            hasher.update(&buffer[..n]);
            file.write_all(&buffer[..n]).await.map_err(io_err)?;
        }

        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        partial.keep();

        Ok((total_size, hex::encode(hasher.finalize())))
    }

    /// Removes staged files last modified before `max_age` ago. Returns how many
    /// were deleted.
    pub async fn sweep_older_than(&self, max_age: Duration) -> Result<usize, StagingError> {
        let io_err = |source| StagingError::Io {
            path: self.root.clone(),
            source,
        };

        let mut entries = fs::read_dir(&self.root).await.map_err(io_err)?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(age) = metadata.modified().and_then(|m| {
                m.elapsed().map_err(std::io::Error::other)
            }) else {
                continue;
            };
            if age < max_age {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    tracing::info!("Swept stale staged file {}", entry.path().display());
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        "Failed to sweep staged file {}: {}",
                        entry.path().display(),
                        e
                    );
                }
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl StagingStore for LocalStagingStore {
    async fn stage<'a>(
        &self,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        original_filename: &str,
    ) -> Result<StagedFile, StagingError> {
        let id = Self::generate_id();
        let extension = dataset_extension(original_filename).unwrap_or_default();
        let file_name = if extension.is_empty() {
            id.clone()
        } else {
            format!("{}.{}", id, extension)
        };
        let path = self.root.join(file_name);

        let (size, sha256) = self.write_stream(&path, reader).await?;
        tracing::debug!(
            staged_id = %id,
            size,
            sha256 = %sha256,
            "Upload staged at {}",
            path.display()
        );
        Ok(StagedFile {
            id,
            path,
            original_extension: extension,
            size,
            sha256,
        })
    }

    async fn release(&self, staged: &StagedFile) -> Result<(), StagingError> {
        match fs::remove_file(&staged.path).await {
            Ok(()) => {
                tracing::debug!(staged_id = %staged.id, "Staged file released");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StagingError::Io {
                path: staged.path.clone(),
                source,
            }),
        }
    }
}

/// Removes a file that is still being written when dropped, whether the write
/// failed or the staging future was cancelled.
struct PartialFile {
    path: Option<PathBuf>,
}

impl PartialFile {
    fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    fn keep(&mut self) {
        self.path = None;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed partial upload {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove partial upload {}: {}", path.display(), e),
        }
    }
}

/// Owns a staged file until it is released. If dropped unreleased (the request
/// future was cancelled) the release is handed to the runtime.
pub struct StagingLease {
    store: Arc<dyn StagingStore>,
    file: StagedFile,
    released: bool,
}

impl StagingLease {
    pub fn new(store: Arc<dyn StagingStore>, file: StagedFile) -> Self {
        Self {
            store,
            file,
            released: false,
        }
    }

    pub fn file(&self) -> &StagedFile {
        &self.file
    }

    pub async fn release(mut self) {
        self.released = true;
        release_logged(self.store.as_ref(), &self.file).await;
    }
}

impl Drop for StagingLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let file = self.file.clone();
                tracing::warn!(staged_id = %file.id, "Request abandoned, releasing staged file");
                handle.spawn(async move {
                    release_logged(store.as_ref(), &file).await;
                });
            }
            Err(_) => {
                // No runtime left; the sweeper will collect it otherwise
                let _ = std::fs::remove_file(&self.file.path);
            }
        }
    }
}

async fn release_logged(store: &dyn StagingStore, file: &StagedFile) {
    if let Err(e) = store.release(file).await {
        tracing::error!(staged_id = %file.id, "Failed to release staged file: {}", e);
    }
}
