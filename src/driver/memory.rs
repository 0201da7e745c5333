use async_trait::async_trait;
use hyper::Method;
use std::collections::BTreeMap;
use std::io;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;

use super::{DriverWriter, FileInfo, Reader, StorageDriver};

type FileMap = Arc<RwLock<BTreeMap<String, Vec<u8>>>>;

/// Reference in-memory driver. Directories are implied by key prefixes,
/// the way object stores behave. Doubles as the test backend.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    files: FileMap,
    redirect_base: Option<String>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver::default()
    }

    /// Serve downloads through `<base><path>` redirects, mimicking a
    /// backend with signed-URL offloading.
    #[cfg(test)]
    pub fn with_redirect_base(base: &str) -> Self {
        MemoryDriver {
            files: FileMap::default(),
            redirect_base: Some(base.to_string()),
        }
    }
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "path not found")
}

fn dir_prefix(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn get_content(&self, path: &str) -> io::Result<Vec<u8>> {
        let files = self.files.read().await;
        files.get(path).cloned().ok_or_else(not_found)
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut files = self.files.write().await;
        files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> io::Result<Box<dyn Reader>> {
        let files = self.files.read().await;
        let content = files.get(path).cloned().ok_or_else(not_found)?;

        let mut cursor = Cursor::new(content);
        cursor.set_position(offset.min(cursor.get_ref().len() as u64));
        Ok(Box::new(cursor))
    }

    async fn writer(&self, path: &str, append: bool) -> io::Result<Box<dyn DriverWriter>> {
        let buffer = if append {
            let files = self.files.read().await;
            files.get(path).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(Box::new(MemoryWriter {
            files: self.files.clone(),
            path: path.to_string(),
            buffer,
        }))
    }

    async fn stat(&self, path: &str) -> io::Result<FileInfo> {
        let files = self.files.read().await;
        if let Some(content) = files.get(path) {
            return Ok(FileInfo {
                size: content.len() as u64,
                is_dir: false,
            });
        }

        let prefix = dir_prefix(path);
        if files.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix)) {
            return Ok(FileInfo {
                size: 0,
                is_dir: true,
            });
        }

        Err(not_found())
    }

    async fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let prefix = dir_prefix(path);
        let files = self.files.read().await;

        let mut children: Vec<String> = Vec::new();
        for key in files.range(prefix.clone()..).map(|(k, _)| k) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            let name = rest.split('/').next().unwrap_or(rest).to_string();
            if children.last() != Some(&name) {
                children.push(name);
            }
        }

        Ok(children)
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let mut files = self.files.write().await;

        if let Some(content) = files.remove(from) {
            files.insert(to.to_string(), content);
            return Ok(());
        }

        let prefix = dir_prefix(from);
        let moved: Vec<String> = files
            .range(prefix.clone()..)
            .map(|(k, _)| k.clone())
            .take_while(|k| k.starts_with(&prefix))
            .collect();
        if moved.is_empty() {
            return Err(not_found());
        }

        for key in moved {
            let content = files.remove(&key).unwrap_or_default();
            let new_key = format!("{}/{}", to.trim_end_matches('/'), &key[prefix.len()..]);
            files.insert(new_key, content);
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        let mut files = self.files.write().await;
        files.remove(path);

        let prefix = dir_prefix(path);
        let doomed: Vec<String> = files
            .range(prefix.clone()..)
            .map(|(k, _)| k.clone())
            .take_while(|k| k.starts_with(&prefix))
            .collect();
        for key in doomed {
            files.remove(&key);
        }
        Ok(())
    }

    fn redirect_url(&self, method: &Method, path: &str) -> Option<String> {
        if *method != Method::GET {
            return None;
        }
        self.redirect_base
            .as_ref()
            .map(|base| format!("{base}{path}"))
    }
}

struct MemoryWriter {
    files: FileMap,
    path: String,
    buffer: Vec<u8>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl DriverWriter for MemoryWriter {
    fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn commit(&mut self) -> io::Result<()> {
        let mut files = self.files.write().await;
        files.insert(self.path.clone(), std::mem::take(&mut self.buffer));
        Ok(())
    }

    async fn cancel(&mut self) -> io::Result<()> {
        self.buffer.clear();
        Ok(())
    }
}
