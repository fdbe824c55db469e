//! Storage driver keeping files in a process-local map.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWrite;

use super::{
    ByteStream, FileInfo, FileWriter, StorageDriver, StorageError, StorageResult, child_path,
    validate_dir_path, validate_path,
};

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    modified: SystemTime,
}

type Files = Arc<RwLock<BTreeMap<String, Entry>>>;

/// Volatile driver for tests and throwaway gateways.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDriver {
    files: Files,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &str) -> Option<Entry> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }
}

/// Returns true when some file lives below `dir`.
fn has_children(files: &BTreeMap<String, Entry>, dir: &str) -> bool {
    let prefix = child_path(dir, "");
    files
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(key, _)| key.starts_with(&prefix))
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    fn name(&self) -> &'static str {
        "inmemory"
    }

    async fn reader(&self, path: &str, offset: u64) -> StorageResult<ByteStream> {
        validate_path(path)?;
        let entry = self
            .entry(path)
            .ok_or_else(|| StorageError::PathNotFound(path.to_string()))?;
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| *start <= entry.data.len())
            .ok_or_else(|| StorageError::InvalidOffset {
                path: path.to_string(),
                offset,
            })?;
        Ok(Box::pin(Cursor::new(entry.data.slice(start..))))
    }

    async fn writer(&self, path: &str, append: bool) -> StorageResult<Box<dyn FileWriter>> {
        validate_path(path)?;
        let buffer = match (append, self.entry(path)) {
            (true, Some(entry)) => entry.data.to_vec(),
            _ => Vec::new(),
        };
        Ok(Box::new(InMemoryWriter {
            files: Arc::clone(&self.files),
            path: path.to_string(),
            buffer,
        }))
    }

    async fn stat(&self, path: &str) -> StorageResult<FileInfo> {
        validate_path(path)?;
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = files.get(path) {
            return Ok(FileInfo {
                path: path.to_string(),
                size: entry.data.len() as u64,
                modified: Some(entry.modified),
                is_dir: false,
            });
        }
        if has_children(&files, path) {
            return Ok(FileInfo {
                path: path.to_string(),
                size: 0,
                modified: None,
                is_dir: true,
            });
        }
        Err(StorageError::PathNotFound(path.to_string()))
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        validate_dir_path(path)?;
        let prefix = child_path(path, "");
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);

        let children: BTreeSet<String> = files
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next())
            .map(|name| child_path(path, name))
            .collect();

        if children.is_empty() && path != "/" {
            return Err(StorageError::PathNotFound(path.to_string()));
        }
        Ok(children.into_iter().collect())
    }

    async fn move_file(&self, source: &str, dest: &str) -> StorageResult<()> {
        validate_path(source)?;
        validate_path(dest)?;
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        let entry = files
            .remove(source)
            .ok_or_else(|| StorageError::PathNotFound(source.to_string()))?;
        files.insert(dest.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        validate_path(path)?;
        let prefix = child_path(path, "");
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        let before = files.len();
        files.retain(|key, _| key != path && !key.starts_with(&prefix));
        if files.len() == before {
            return Err(StorageError::PathNotFound(path.to_string()));
        }
        Ok(())
    }
}

struct InMemoryWriter {
    files: Files,
    path: String,
    buffer: Vec<u8>,
}

impl AsyncWrite for InMemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl FileWriter for InMemoryWriter {
    fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let this = *self;
        let entry = Entry {
            data: Bytes::from(this.buffer),
            modified: SystemTime::now(),
        };
        this.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(this.path, entry);
        Ok(())
    }

    async fn cancel(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}
