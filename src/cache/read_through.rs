//! Storage-backed read-through cache.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::storage::{ByteStream, StorageDriver, StorageError};

/// Serves paths from storage and populates missing ones through a loader.
///
/// Only one caller populates a given path at a time. A caller that misses
/// while the path is being populated gets the loader output directly and
/// nothing is written for it, so contended paths may be fetched upstream
/// more than once.
#[derive(Debug)]
pub struct ReadThroughCache {
    storage: Arc<dyn StorageDriver>,
    inflight: Mutex<HashSet<String>>,
}

impl ReadThroughCache {
    pub fn new(storage: Arc<dyn StorageDriver>) -> Self {
        Self {
            storage,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageDriver> {
        &self.storage
    }

    /// Returns the stored content of `path`, loading and storing it first
    /// when absent. Loader errors are returned unchanged.
    pub async fn read<F, Fut, E>(&self, path: &str, loader: F) -> Result<ByteStream, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ByteStream, E>>,
        E: From<StorageError>,
    {
        match self.storage.reader(path, 0).await {
            Ok(reader) => return Ok(reader),
            Err(StorageError::PathNotFound(_)) => {}
            Err(e) => warn!("treating failed read of {} as a miss: {}", path, e),
        }

        let Some(_guard) = InflightGuard::acquire(&self.inflight, path) else {
            debug!("{} is being populated, loading without caching", path);
            return loader().await;
        };

        debug!("cache miss for {}", path);
        let mut body = loader().await?;
        self.store(path, &mut body).await?;

        Ok(self.storage.reader(path, 0).await?)
    }

    async fn store(&self, path: &str, body: &mut ByteStream) -> Result<(), StorageError> {
        let mut writer = self.storage.writer(path, false).await?;
        match tokio::io::copy(body, &mut writer).await {
            Ok(written) => {
                writer.commit().await?;
                debug!("stored {} bytes at {}", written, path);
                Ok(())
            }
            Err(e) => {
                if let Err(cancel) = writer.cancel().await {
                    warn!("failed to cancel write of {}: {}", path, cancel);
                }
                Err(e.into())
            }
        }
    }
}

/// Marks a path as being populated until dropped.
struct InflightGuard<'a> {
    paths: &'a Mutex<HashSet<String>>,
    path: String,
}

impl<'a> InflightGuard<'a> {
    /// Returns `None` when `path` is already being populated.
    fn acquire(paths: &'a Mutex<HashSet<String>>, path: &str) -> Option<Self> {
        let inserted = paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string());
        inserted.then(|| Self {
            paths,
            path: path.to_string(),
        })
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}
