use std::{fmt, io as stdio, ops::Deref, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use eyre::eyre;
use tokio::io;

use crate::error::StorageError;

/// A reader stream for object contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for object contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// The creation timestamp of the object.
    pub created: DateTime<Utc>,
}

/// A storage driver, which provides the ability to interact with a storage backend.
///
/// Objects are addressed by a bucket name and a relative path. Whole-object
/// uploads must become visible atomically: a concurrent reader observes
/// either the previous object or the complete new one, never a prefix.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Delete an object from the storage, by path.
    ///
    /// Fails with [`crate::StorageErrorKind::NotFound`] if there is no such object.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for an object, by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Upload an object to the storage, using a reader stream to provide the contents.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Download an object from storage, into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// List the objects in a bucket, optionally filtered by a prefix.
    ///
    /// A prefix with no objects below it yields an empty list.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;

    /// Write the reader's contents into an object starting at `offset`.
    ///
    /// The object is created when absent and `offset` is zero. Bytes inside
    /// the existing object are overwritten, and the object is extended when the
    /// write runs past its end; it is never truncated. Returns the number of
    /// bytes written, which are durable once this returns.
    ///
    /// The default implementation splices through a full download and upload.
    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let mut existing = Vec::new();
        match self.download(bucket, remote, &mut existing).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let mut incoming = Vec::new();
        let written = io::copy_buf(reader, &mut incoming)
            .await
            .map_err(|err| {
                StorageError::io(self.name(), err)
                    .bucket(bucket)
                    .path(remote.as_str())
                    .context("read incoming bytes")
                    .build()
            })?;

        splice_at(&mut existing, offset, &incoming).map_err(|err| {
            StorageError::io(self.name(), err)
                .bucket(bucket)
                .path(remote.as_str())
                .context("write_at")
                .build()
        })?;

        let mut contents: &[u8] = &existing;
        self.upload(bucket, remote, &mut contents).await?;
        Ok(written)
    }

    /// Move an object to a new path, replacing any object already there.
    ///
    /// The default implementation copies and then deletes the source.
    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%from, %to, "rename by copy");
        let mut contents = Vec::new();
        self.download(bucket, from, &mut contents).await?;
        let mut reader: &[u8] = &contents;
        self.upload(bucket, to, &mut reader).await?;
        self.delete(bucket, from).await
    }

    /// Delete every object below a prefix.
    async fn delete_prefix(&self, bucket: &str, prefix: &Utf8Path) -> Result<(), StorageError> {
        for path in self.list(bucket, Some(prefix)).await? {
            match self.delete(bucket, Utf8Path::new(&path)).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Overwrite `target` with `data` starting at `offset`, growing it when the
/// write runs past the current end.
///
/// Fails with [`std::io::ErrorKind::InvalidInput`] when `offset` lies beyond
/// the end of `target`, as that would leave a hole.
pub fn splice_at(target: &mut Vec<u8>, offset: u64, data: &[u8]) -> Result<(), stdio::Error> {
    let len = target.len() as u64;
    if offset > len {
        return Err(stdio::Error::new(
            stdio::ErrorKind::InvalidInput,
            eyre!("offset {offset} is beyond the end of the object ({len} bytes)"),
        ));
    }

    let start = offset as usize;
    let overlap = data.len().min(target.len() - start);
    target[start..start + overlap].copy_from_slice(&data[..overlap]);
    target.extend_from_slice(&data[overlap..]);
    Ok(())
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, remote, writer).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.deref().write_at(bucket, remote, offset, reader).await
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.deref().rename(bucket, from, to).await
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete_prefix(bucket, prefix).await
    }
}
