//! Decorator that stores everything under a sub-directory of another driver.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ByteStream, FileInfo, FileWriter, StorageDriver, StorageResult};

/// Prefixes every path with `/<name>` before delegating to `inner`.
#[derive(Debug, Clone)]
pub struct DirectoryDriver {
    prefix: String,
    inner: Arc<dyn StorageDriver>,
}

impl DirectoryDriver {
    pub fn new(name: &str, inner: Arc<dyn StorageDriver>) -> Self {
        Self {
            prefix: format!("/{}", name.trim_matches('/')),
            inner,
        }
    }

    fn subpath(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    fn strip<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.prefix.as_str()).unwrap_or(path)
    }
}

#[async_trait]
impl StorageDriver for DirectoryDriver {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn reader(&self, path: &str, offset: u64) -> StorageResult<ByteStream> {
        self.inner.reader(&self.subpath(path), offset).await
    }

    async fn writer(&self, path: &str, append: bool) -> StorageResult<Box<dyn FileWriter>> {
        self.inner.writer(&self.subpath(path), append).await
    }

    async fn stat(&self, path: &str) -> StorageResult<FileInfo> {
        let mut info = self.inner.stat(&self.subpath(path)).await?;
        info.path = self.strip(&info.path).to_string();
        Ok(info)
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let subpath = self.subpath(path);
        let children = self.inner.list(subpath.trim_end_matches('/')).await?;
        Ok(children
            .iter()
            .map(|child| self.strip(child).to_string())
            .collect())
    }

    async fn move_file(&self, source: &str, dest: &str) -> StorageResult<()> {
        self.inner
            .move_file(&self.subpath(source), &self.subpath(dest))
            .await
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.inner.delete(&self.subpath(path)).await
    }
}
