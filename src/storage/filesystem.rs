//! Storage driver rooted at a local directory.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use rand::Rng;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{
    ByteStream, FileInfo, FileWriter, StorageDriver, StorageError, StorageResult, child_path,
    is_valid_segment, validate_dir_path, validate_path,
};

/// Suffix of in-progress uploads. `#` never appears in a valid segment, so
/// upload files cannot collide with stored paths and are skipped by `list`.
const UPLOAD_SUFFIX: &str = "#upload";

#[derive(Debug, Clone)]
pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

fn map_not_found(path: &str) -> impl FnOnce(std::io::Error) -> StorageError {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            StorageError::PathNotFound(path.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

fn upload_path(target: &Path) -> PathBuf {
    let mut tag = [0u8; 8];
    rand::rng().fill(&mut tag);
    let tag: String = tag.iter().map(|b| format!("{:02x}", b)).collect();

    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}{}", tag, UPLOAD_SUFFIX));
    target.with_file_name(name)
}

#[async_trait]
impl StorageDriver for FilesystemDriver {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn reader(&self, path: &str, offset: u64) -> StorageResult<ByteStream> {
        validate_path(path)?;
        let mut file = File::open(self.full_path(path))
            .await
            .map_err(map_not_found(path))?;

        let metadata = file.metadata().await?;
        if metadata.is_dir() {
            return Err(StorageError::PathNotFound(path.to_string()));
        }
        if offset > metadata.len() {
            return Err(StorageError::InvalidOffset {
                path: path.to_string(),
                offset,
            });
        }
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::pin(file))
    }

    async fn writer(&self, path: &str, append: bool) -> StorageResult<Box<dyn FileWriter>> {
        validate_path(path)?;
        let target = self.full_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let upload = upload_path(&target);
        let mut size = 0;
        if append {
            match fs::copy(&target, &upload).await {
                Ok(copied) => size = copied,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&upload)
            .await?;

        debug!("opened upload {} for {}", upload.display(), path);

        Ok(Box::new(FilesystemWriter {
            file,
            upload,
            target,
            size,
            finished: false,
        }))
    }

    async fn stat(&self, path: &str) -> StorageResult<FileInfo> {
        validate_path(path)?;
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(map_not_found(path))?;
        Ok(FileInfo {
            path: path.to_string(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: metadata.modified().ok(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        validate_dir_path(path)?;
        let mut entries = fs::read_dir(self.full_path(path))
            .await
            .map_err(map_not_found(path))?;

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            match name.to_str() {
                Some(name) if is_valid_segment(name) => children.push(child_path(path, name)),
                _ => {}
            }
        }
        children.sort();
        Ok(children)
    }

    async fn move_file(&self, source: &str, dest: &str) -> StorageResult<()> {
        validate_path(source)?;
        validate_path(dest)?;
        let target = self.full_path(dest);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.full_path(source), target)
            .await
            .map_err(map_not_found(source))
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        validate_path(path)?;
        let full = self.full_path(path);
        let metadata = fs::metadata(&full).await.map_err(map_not_found(path))?;
        if metadata.is_dir() {
            fs::remove_dir_all(full).await?;
        } else {
            fs::remove_file(full).await?;
        }
        Ok(())
    }
}

/// Writes into a sibling upload file that is renamed over the target on commit.
struct FilesystemWriter {
    file: File,
    upload: PathBuf,
    target: PathBuf,
    size: u64,
    finished: bool,
}

impl AsyncWrite for FilesystemWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let poll = Pin::new(&mut self.file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.size += n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl FileWriter for FilesystemWriter {
    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.file.flush().await?;
        this.file.sync_all().await?;
        fs::rename(&this.upload, &this.target).await?;
        this.finished = true;
        Ok(())
    }

    async fn cancel(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.finished = true;
        match fs::remove_file(&this.upload).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl Drop for FilesystemWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.upload)
            && e.kind() != ErrorKind::NotFound
        {
            warn!("failed to remove abandoned upload {}: {}", self.upload.display(), e);
        }
    }
}
