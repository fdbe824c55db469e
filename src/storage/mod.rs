//! Storage capability consumed by the caches.
//!
//! Paths are absolute and `/`-separated. Every segment is made of
//! `[A-Za-z0-9+:~._-]` and may not be `.` or `..`.

mod directory;
mod filesystem;
mod memory;

use std::pin::Pin;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use directory::DirectoryDriver;
pub use filesystem::FilesystemDriver;
pub use memory::InMemoryDriver;

/// A readable byte stream handed out by drivers and caches.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid offset {offset} for {path}")]
    InvalidOffset { path: String, offset: u64 },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::PathNotFound(_))
    }
}

/// Metadata returned by [`StorageDriver::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
}

/// A pending write. Nothing is visible to readers until `commit`.
#[async_trait]
pub trait FileWriter: AsyncWrite + Send + Unpin {
    /// Bytes written so far, including any content kept for append.
    fn size(&self) -> u64;

    async fn commit(self: Box<Self>) -> StorageResult<()>;

    async fn cancel(self: Box<Self>) -> StorageResult<()>;
}

#[async_trait]
pub trait StorageDriver: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Opens `path` for reading starting at byte `offset`.
    async fn reader(&self, path: &str, offset: u64) -> StorageResult<ByteStream>;

    /// Opens a writer for `path`. With `append` the existing content is
    /// kept and new bytes follow it; otherwise the file is replaced.
    async fn writer(&self, path: &str, append: bool) -> StorageResult<Box<dyn FileWriter>>;

    async fn stat(&self, path: &str) -> StorageResult<FileInfo>;

    /// Lists the direct children of the directory at `path`.
    async fn list(&self, path: &str) -> StorageResult<Vec<String>>;

    async fn move_file(&self, source: &str, dest: &str) -> StorageResult<()>;

    /// Deletes a file or a whole directory tree.
    async fn delete(&self, path: &str) -> StorageResult<()>;

    async fn get_content(&self, path: &str) -> StorageResult<Vec<u8>> {
        let mut reader = self.reader(path, 0).await?;
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        Ok(content)
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> StorageResult<()> {
        let mut writer = self.writer(path, false).await?;
        if let Err(e) = writer.write_all(content).await {
            let _ = writer.cancel().await;
            return Err(e.into());
        }
        writer.commit().await
    }
}

/// Checks that `path` is an absolute storage path of valid segments.
pub fn validate_path(path: &str) -> StorageResult<()> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(StorageError::InvalidPath(path.to_string()));
    };
    if rest.split('/').all(is_valid_segment) {
        Ok(())
    } else {
        Err(StorageError::InvalidPath(path.to_string()))
    }
}

/// Like [`validate_path`] but also accepts the root `/`, for listing.
fn validate_dir_path(path: &str) -> StorageResult<()> {
    if path == "/" {
        Ok(())
    } else {
        validate_path(path)
    }
}

pub(crate) fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"+:~._-".contains(&b))
}

/// Joins a directory path and a child name.
fn child_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests paths that must be accepted.
    #[test]
    fn accepts_registry_style_paths() {
        assert!(validate_path("/a").is_ok());
        assert!(validate_path("/dists/noble/InRelease").is_ok());
        assert!(validate_path("/pool/main/libc6_2.39-0ubuntu8+b1_amd64.deb").is_ok());
        assert!(validate_path("/v2/library/nginx/blobs/sha256:abc~1").is_ok());
    }

    /// Tests paths that must be rejected.
    #[test]
    fn rejects_malformed_paths() {
        for path in ["", "/", "relative", "/a//b", "/a/", "/a/../b", "/./a", "/a b", "/a?b"] {
            assert!(
                matches!(validate_path(path), Err(StorageError::InvalidPath(_))),
                "{path:?} should be rejected"
            );
        }
    }

    /// Tests that the root is valid only as a directory.
    #[test]
    fn root_is_listable() {
        assert!(validate_dir_path("/").is_ok());
        assert!(validate_dir_path("/a").is_ok());
        assert!(validate_dir_path("").is_err());
    }
}
