use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::io::{ErrorKind, SeekFrom, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use super::{DriverWriter, FileInfo, Reader, StorageDriver};

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FsConfig {
    pub root_dir: String,
    #[serde(default)]
    pub sync_to_disk: bool,
}

/// Local filesystem driver. `put_content` stages through a temp file in
/// the destination directory and persists with a rename, so a crashed
/// write leaves the prior content intact.
#[derive(Clone, Debug)]
pub struct FsDriver {
    root: PathBuf,
    sync_to_disk: bool,
}

impl FsDriver {
    pub fn new(config: FsConfig) -> Self {
        FsDriver {
            root: PathBuf::from(config.root_dir),
            sync_to_disk: config.sync_to_disk,
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl StorageDriver for FsDriver {
    async fn get_content(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.full_path(path)).await
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let full_path = self.full_path(path);
        let parent = full_path
            .parent()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
        fs::create_dir_all(parent).await?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(content)?;

        if self.sync_to_disk {
            temp_file.flush()?;
            temp_file.as_file().sync_all()?;
        }

        temp_file.persist(full_path)?;
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> io::Result<Box<dyn Reader>> {
        let mut file = fs::File::open(self.full_path(path)).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn writer(&self, path: &str, append: bool) -> io::Result<Box<dyn DriverWriter>> {
        let full_path = self.full_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = if append {
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&full_path)
                .await?
        } else {
            fs::File::create(&full_path).await?
        };

        let base = file.metadata().await?.len();
        Ok(Box::new(FsWriter {
            file,
            base,
            written: 0,
            sync_to_disk: self.sync_to_disk,
        }))
    }

    async fn stat(&self, path: &str) -> io::Result<FileInfo> {
        let metadata = fs::metadata(self.full_path(path)).await?;
        Ok(FileInfo {
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
        })
    }

    async fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let mut entries = Vec::new();

        let mut read_dir = match fs::read_dir(self.full_path(path)).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let to_path = self.full_path(to);
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.full_path(from), to_path).await
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        let full_path = self.full_path(path);
        let metadata = match fs::metadata(&full_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        if metadata.is_dir() {
            fs::remove_dir_all(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        }
    }
}

struct FsWriter {
    file: fs::File,
    base: u64,
    written: u64,
    sync_to_disk: bool,
}

impl AsyncWrite for FsWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                self.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl DriverWriter for FsWriter {
    fn size(&self) -> u64 {
        self.base + self.written
    }

    async fn commit(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        if self.sync_to_disk {
            self.file.sync_all().await?;
        }
        Ok(())
    }

    async fn cancel(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.set_len(self.base).await?;
        self.written = 0;
        Ok(())
    }
}
