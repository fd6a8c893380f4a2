//! File storage for rendered outputs and submitted sources.
//!
//! Files live on the local filesystem under a root directory and are exposed
//! to clients under a public URL prefix (`/static/videos/<file name>`).

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StorageError;

/// Result of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The file was already gone.
    NotFound,
}

/// A file written through [`FileStore::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub url: String,
}

/// Storage backend for job files.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Writes `data` as `file_name` under the store root.
    async fn save(&self, file_name: &str, data: &[u8]) -> Result<StoredFile, StorageError>;

    /// Deletes the file at `location`. A missing file is not an error.
    async fn delete(&self, location: &str) -> Result<DeleteOutcome, StorageError>;

    /// Public URL clients use to fetch the file at `location`.
    fn public_url(&self, location: &str) -> String;

    /// Whether `location` names a file written by this store.
    fn holds(&self, location: &str) -> bool;
}

/// [`FileStore`] backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Returns the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a stored location onto a path inside the root.
    ///
    /// Locations may be given relative to the root or already prefixed with
    /// it; anything that could escape the root is refused.
    fn resolve(&self, location: &str) -> Result<PathBuf, StorageError> {
        let path = Path::new(location);
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(StorageError::OutsideRoot(path.to_path_buf()));
        }

        if path.starts_with(&self.root) {
            Ok(path.to_path_buf())
        } else if path.is_relative() {
            Ok(self.root.join(path))
        } else {
            Err(StorageError::OutsideRoot(path.to_path_buf()))
        }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(&self, file_name: &str, data: &[u8]) -> Result<StoredFile, StorageError> {
        let name = Path::new(file_name);
        let is_plain_name = matches!(
            name.components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        );
        if !is_plain_name {
            return Err(StorageError::OutsideRoot(name.to_path_buf()));
        }

        fs::create_dir_all(&self.root).await?;

        let path = self.root.join(name);
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;

        debug!(path = %path.display(), bytes = data.len(), "File stored");

        let url = self.public_url(&path.to_string_lossy());
        Ok(StoredFile { path, url })
    }

    async fn delete(&self, location: &str) -> Result<DeleteOutcome, StorageError> {
        let path = self.resolve(location)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "File deleted");
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn holds(&self, location: &str) -> bool {
        let path = Path::new(location);
        path.starts_with(&self.root)
            && path != self.root.as_path()
            && !path.components().any(|c| matches!(c, Component::ParentDir))
    }

    fn public_url(&self, location: &str) -> String {
        let file_name = Path::new(location)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/{}", self.url_prefix, file_name)
    }
}
