//! Layer handles and the per-repository layer service

use std::io::{Cursor, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

use crate::blob::BlobStore;
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::repository::RepositoryName;
use crate::upload::LayerUpload;

/// A readable, seekable handle to a committed blob.
///
/// Seeking to the end is cheap, so range requests can be served directly.
/// A handle is not meant to be shared between tasks; fetch another instead.
#[derive(Debug)]
pub struct Layer {
    digest: Digest,
    created_at: DateTime<Utc>,
    cursor: Cursor<Bytes>,
}

impl Layer {
    pub(crate) fn new(digest: Digest, content: Bytes, created_at: DateTime<Utc>) -> Self {
        Self {
            digest,
            created_at,
            cursor: Cursor::new(content),
        }
    }

    /// The digest of the blob.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// The length of the blob in bytes.
    pub fn length(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    /// When the blob was committed.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Wire description of the blob.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::blob(self.digest.clone(), self.length())
    }

    /// Release the handle.
    pub fn close(self) {}
}

impl AsyncRead for Layer {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.cursor).poll_read(cx, buf)
    }
}

impl AsyncSeek for Layer {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        Pin::new(&mut self.cursor).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut self.cursor).poll_complete(cx)
    }
}

/// Layer blobs as seen from one repository, plus uploads into it.
#[derive(Debug, Clone)]
pub struct LayerService {
    repository: RepositoryName,
    blobs: BlobStore,
}

impl LayerService {
    pub(crate) fn new(repository: RepositoryName, blobs: BlobStore) -> Self {
        Self { repository, blobs }
    }

    /// Whether a committed layer with this digest exists.
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        self.blobs.exists(digest).await
    }

    /// Open a committed layer.
    pub async fn fetch(&self, digest: &Digest) -> RegistryResult<Layer> {
        self.blobs.fetch(digest).await
    }

    /// Begin a new upload session at offset zero.
    #[tracing::instrument(skip(self), fields(repository = %self.repository))]
    pub async fn upload(&self) -> RegistryResult<LayerUpload> {
        LayerUpload::start(self.blobs.clone(), self.repository.clone()).await
    }

    /// Reattach to an open upload session.
    ///
    /// The returned handle is positioned at the persisted size. Callers that
    /// intend to continue elsewhere must seek first.
    #[tracing::instrument(skip(self), fields(repository = %self.repository))]
    pub async fn resume(&self, uuid: &str) -> RegistryResult<LayerUpload> {
        LayerUpload::resume(self.blobs.clone(), self.repository.clone(), uuid).await
    }
}
