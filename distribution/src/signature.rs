//! Detached signatures attached to committed blobs
//!
//! Each signature is stored as its own object named by the signature's
//! sha256 digest. Identical signatures therefore collapse into one entry and
//! the accumulated set only ever grows.

use bytes::Bytes;
use futures::future::try_join_all;

use crate::blob::{BlobStore, read_object, write_object};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::paths;
use crate::repository::RepositoryName;

/// Signatures of one repository, keyed by the digest they sign.
#[derive(Debug, Clone)]
pub struct SignatureService {
    repository: RepositoryName,
    blobs: BlobStore,
}

impl SignatureService {
    pub(crate) fn new(repository: RepositoryName, blobs: BlobStore) -> Self {
        Self { repository, blobs }
    }

    /// Every signature recorded for `digest`, ordered by signature digest.
    ///
    /// Fails with `NotFound` if `digest` is not a committed blob.
    #[tracing::instrument(skip(self), fields(repository = %self.repository, %digest))]
    pub async fn get(&self, digest: &Digest) -> RegistryResult<Vec<Bytes>> {
        self.ensure_signed_blob(digest).await?;

        let root = paths::signatures(&self.repository, digest);
        let mut objects = self.blobs.storage().list(Some(&root)).await?;
        objects.sort();

        let storage = self.blobs.storage();
        let reads = objects
            .iter()
            .map(|object| read_object(storage, camino::Utf8Path::new(object)));

        // A signature vanishing mid-listing is skipped.
        let signatures = try_join_all(reads).await?;
        Ok(signatures.into_iter().flatten().map(Bytes::from).collect())
    }

    /// Add `signatures` to the set recorded for `digest`.
    ///
    /// Fails with `NotFound` if `digest` is not a committed blob.
    #[tracing::instrument(skip(self, signatures), fields(repository = %self.repository, %digest))]
    pub async fn put<I, S>(&self, digest: &Digest, signatures: I) -> RegistryResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let signatures: Vec<S> = signatures.into_iter().collect();
        if signatures.is_empty() {
            return Ok(());
        }
        self.ensure_signed_blob(digest).await?;

        let storage = self.blobs.storage();
        for signature in &signatures {
            let data = signature.as_ref();
            let path = paths::signature(&self.repository, digest, &Digest::sha256(data));
            write_object(storage, &path, data).await?;
        }
        tracing::debug!(count = signatures.len(), "signatures stored");
        Ok(())
    }

    async fn ensure_signed_blob(&self, digest: &Digest) -> RegistryResult<()> {
        if self.blobs.exists(digest).await? {
            Ok(())
        } else {
            Err(RegistryError::BlobNotFound(digest.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use storage::{MemoryStorage, Storage};

    fn service() -> SignatureService {
        let storage: Storage = MemoryStorage::new().into();
        SignatureService::new(
            "org/app".parse().unwrap(),
            BlobStore::new(storage.bucket("test")),
        )
    }

    #[tokio::test]
    async fn signatures_accumulate_as_a_set() {
        let service = service();
        let digest = service.blobs.put(b"manifest").await.unwrap();
        assert!(service.get(&digest).await.unwrap().is_empty());

        service.put(&digest, [b"sig-one"]).await.unwrap();
        service.put(&digest, [&b"sig-two"[..], b"sig-one"]).await.unwrap();

        let mut expected = vec![
            Bytes::from_static(b"sig-one"),
            Bytes::from_static(b"sig-two"),
        ];
        expected.sort_by_key(|s| Digest::sha256(s).to_string());
        assert_eq!(service.get(&digest).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn signatures_are_scoped_to_repository() {
        let service = service();
        let digest = service.blobs.put(b"manifest").await.unwrap();
        service.put(&digest, [b"sig"]).await.unwrap();

        let other = SignatureService::new("org/other".parse().unwrap(), service.blobs.clone());
        assert!(other.get(&digest).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_digest_is_not_found() {
        let service = service();
        let digest = Digest::sha256(b"never stored");

        assert_eq!(
            service.get(&digest).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            service.put(&digest, [b"sig"]).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        service.put(&digest, Vec::<Vec<u8>>::new()).await.unwrap();
    }
}
