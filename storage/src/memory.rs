use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{
    splice_at, Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer,
};

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that keeps objects in memory.
///
/// Buckets are created on first write. Every mutation happens under a single
/// write lock, so whole-object uploads and renames are atomic.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new, empty `MemoryStorage`.
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(&self, bucket: &str, remote: &Utf8Path) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Path not found: {remote}"),
            ),
        )
        .bucket(bucket)
        .path(remote.as_str())
        .build()
    }

    fn io_error(&self, bucket: &str, remote: &Utf8Path, err: std::io::Error) -> StorageError {
        StorageError::io(self.name(), err)
            .bucket(bucket)
            .path(remote.as_str())
            .build()
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(remote))
            .map(Metadata::from)
            .ok_or_else(|| self.not_found(bucket, remote))
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        buckets
            .get_mut(bucket)
            .and_then(|objects| objects.remove(remote))
            .map(|_| ())
            .ok_or_else(|| self.not_found(bucket, remote))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(local, &mut buf)
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        buf.shutdown()
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        let mut buckets = self.buckets.write().await;
        let objects = buckets.entry(bucket.to_string()).or_default();
        objects.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        // Copy out under the read lock, write to the caller without it.
        let data = {
            let buckets = self.buckets.read().await;
            buckets
                .get(bucket)
                .and_then(|objects| objects.get(remote))
                .map(|item| item.as_ref().to_vec())
                .ok_or_else(|| self.not_found(bucket, remote))?
        };

        local
            .write_all(&data)
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        local
            .flush()
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        let mut paths = Vec::new();
        for path in objects.keys() {
            if let Some(prefix) = prefix {
                if path.starts_with(prefix) {
                    paths.push(path.to_string());
                }
            } else {
                paths.push(path.to_string());
            }
        }

        Ok(paths)
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let mut incoming = Vec::new();
        let written = tokio::io::copy_buf(reader, &mut incoming)
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        let mut buckets = self.buckets.write().await;
        let objects = buckets.entry(bucket.to_string()).or_default();
        if offset == 0 && !objects.contains_key(remote) {
            objects.insert(remote.to_owned(), Vec::new().into());
        }
        let item = objects
            .get_mut(remote)
            .ok_or_else(|| self.not_found(bucket, remote))?;

        splice_at(&mut item.data, offset, &incoming).map_err(|err| {
            StorageError::io(self.name(), err)
                .bucket(bucket)
                .path(remote.as_str())
                .context("write_at")
                .build()
        })?;

        Ok(written)
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.not_found(bucket, from))?;
        let item = objects
            .remove(from)
            .ok_or_else(|| self.not_found(bucket, from))?;
        objects.insert(to.to_owned(), item);
        Ok(())
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        if let Some(objects) = buckets.get_mut(bucket) {
            objects.retain(|path, _| !path.starts_with(prefix));
        }
        Ok(())
    }
}
