//! Content-addressable blob storage shared by every repository

use std::sync::Arc;

use bytes::Bytes;
use camino::Utf8Path;
use dashmap::{DashMap, DashSet};
use storage::{StorageBucket, StorageError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::layer::Layer;
use crate::paths;

/// Committed, immutable blobs keyed by digest.
///
/// Nothing reaches `blobs/` without its digest having been recomputed from
/// the stored bytes. Commits for one digest are serialized, so racing uploads
/// of identical content produce a single blob and both succeed.
#[derive(Debug, Clone)]
pub struct BlobStore {
    storage: StorageBucket,
    commits: Arc<DashMap<Digest, Arc<Mutex<()>>>>,
    leases: Arc<DashSet<Uuid>>,
}

impl BlobStore {
    /// Blob store over one storage bucket.
    pub fn new(storage: StorageBucket) -> Self {
        Self {
            storage,
            commits: Default::default(),
            leases: Default::default(),
        }
    }

    pub(crate) fn storage(&self) -> &StorageBucket {
        &self.storage
    }

    /// Whether a committed blob with this digest is present.
    ///
    /// Bytes of in-flight uploads live elsewhere and are never reported.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        match self.storage.metadata(&paths::blob_data(digest)).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Describe a committed blob.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn stat(&self, digest: &Digest) -> RegistryResult<Descriptor> {
        let metadata = self
            .storage
            .metadata(&paths::blob_data(digest))
            .await
            .map_err(|err| not_found_as(err, || RegistryError::BlobNotFound(digest.clone())))?;
        Ok(Descriptor::blob(digest.clone(), metadata.size))
    }

    /// Open a committed blob for random-access reads.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn fetch(&self, digest: &Digest) -> RegistryResult<Layer> {
        let path = paths::blob_data(digest);
        let metadata = self
            .storage
            .metadata(&path)
            .await
            .map_err(|err| not_found_as(err, || RegistryError::BlobNotFound(digest.clone())))?;
        let content = self.read(digest).await?;
        Ok(Layer::new(digest.clone(), content, metadata.created))
    }

    /// Read a whole committed blob.
    pub async fn read(&self, digest: &Digest) -> RegistryResult<Bytes> {
        let mut data = Vec::new();
        self.storage
            .download(&paths::blob_data(digest), &mut data)
            .await
            .map_err(|err| not_found_as(err, || RegistryError::BlobNotFound(digest.clone())))?;
        Ok(data.into())
    }

    /// Store `data` under its SHA-256 digest.
    ///
    /// Storing content that is already present is a no-op.
    #[tracing::instrument(skip(self, data), fields(len = data.len()))]
    pub async fn put(&self, data: &[u8]) -> RegistryResult<Digest> {
        let digest = Digest::sha256(data);
        let _guard = self.lock(&digest).await;

        if !self.exists(&digest).await? {
            let mut reader = data;
            self.storage
                .upload(&paths::blob_data(&digest), &mut reader)
                .await?;
            tracing::debug!(%digest, "blob stored");
        }
        Ok(digest)
    }

    /// Promote already verified upload bytes at `source` to the blob for `digest`.
    ///
    /// The caller must have recomputed `digest` from the bytes at `source`.
    pub(crate) async fn commit(&self, source: &Utf8Path, digest: &Digest) -> RegistryResult<()> {
        let _guard = self.lock(digest).await;

        if self.exists(digest).await? {
            tracing::debug!(%digest, "blob already committed, discarding upload bytes");
            match self.storage.delete(source).await {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => {}
            }
        } else {
            self.storage
                .rename(source, &paths::blob_data(digest))
                .await?;
            tracing::debug!(%digest, "blob committed");
        }
        Ok(())
    }

    async fn lock(&self, digest: &Digest) -> CommitGuard {
        let lock = Arc::clone(self.commits.entry(digest.clone()).or_default().value());
        let guard = lock.lock_owned().await;
        CommitGuard {
            table: self.commits.clone(),
            digest: digest.clone(),
            guard: Some(guard),
        }
    }

    /// Claim exclusive use of an upload session within this process.
    pub(crate) fn lease(&self, uuid: Uuid) -> RegistryResult<Lease> {
        if !self.leases.insert(uuid) {
            return Err(RegistryError::InvalidSession {
                uuid,
                reason: "held by another handle",
            });
        }
        Ok(Lease {
            table: self.leases.clone(),
            uuid,
        })
    }
}

/// Map a storage `NotFound` onto a specific registry error.
pub(crate) fn not_found_as<F>(err: StorageError, missing: F) -> RegistryError
where
    F: FnOnce() -> RegistryError,
{
    if err.is_not_found() {
        missing()
    } else {
        err.into()
    }
}

/// Read a small bookkeeping object, `None` when absent.
pub(crate) async fn read_object(
    storage: &StorageBucket,
    path: &Utf8Path,
) -> RegistryResult<Option<Vec<u8>>> {
    let mut data = Vec::new();
    match storage.download(path, &mut data).await {
        Ok(()) => Ok(Some(data)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Replace a small bookkeeping object.
pub(crate) async fn write_object(
    storage: &StorageBucket,
    path: &Utf8Path,
    data: &[u8],
) -> RegistryResult<()> {
    let mut reader = data;
    storage.upload(path, &mut reader).await?;
    Ok(())
}

struct CommitGuard {
    table: Arc<DashMap<Digest, Arc<Mutex<()>>>>,
    digest: Digest,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.table
            .remove_if(&self.digest, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Exclusive in-process claim on an upload session, released on drop.
#[derive(Debug)]
pub(crate) struct Lease {
    table: Arc<DashSet<Uuid>>,
    uuid: Uuid,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.table.remove(&self.uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use storage::{MemoryStorage, Storage};
    use tokio::io::AsyncReadExt;

    fn blobs() -> BlobStore {
        let storage: Storage = MemoryStorage::new().into();
        BlobStore::new(storage.bucket("test"))
    }

    #[tokio::test]
    async fn test_put_and_fetch() {
        let blobs = blobs();
        let digest = blobs.put(b"test data").await.unwrap();
        assert_eq!(digest, Digest::sha256(b"test data"));
        assert!(blobs.exists(&digest).await.unwrap());

        let descriptor = blobs.stat(&digest).await.unwrap();
        assert_eq!(descriptor.length, 9);

        let mut layer = blobs.fetch(&digest).await.unwrap();
        let mut content = Vec::new();
        layer.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"test data");

        assert_eq!(blobs.put(b"test data").await.unwrap(), digest);
        assert!(blobs.commits.is_empty());
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let blobs = blobs();
        let digest = Digest::sha256(b"absent");
        assert!(!blobs.exists(&digest).await.unwrap());
        assert_eq!(
            blobs.fetch(&digest).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            blobs.stat(&digest).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let blobs = blobs();
        let digest = Digest::sha256(b"same");

        for source in ["staging/one", "staging/two"] {
            write_object(blobs.storage(), Utf8Path::new(source), b"same")
                .await
                .unwrap();
            blobs.commit(Utf8Path::new(source), &digest).await.unwrap();
        }

        let listed = blobs.storage().list(None).await.unwrap();
        assert_eq!(listed, vec![paths::blob_data(&digest).to_string()]);
    }

    #[test]
    fn test_leases_are_exclusive() {
        let blobs = blobs();
        let uuid = Uuid::new_v4();

        let lease = blobs.lease(uuid).unwrap();
        assert_eq!(
            blobs.lease(uuid).unwrap_err().kind(),
            ErrorKind::InvalidSession
        );
        drop(lease);
        assert!(blobs.leases.is_empty());

        let _again = blobs.lease(uuid).unwrap();
        assert!(blobs.leases.contains(&uuid));
    }
}
