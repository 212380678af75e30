//! Resumable upload sessions
//!
//! A session is a pair of objects in the repository's upload area: the bytes
//! received so far (`data`) and a small JSON record holding its identity and
//! state. The storage driver, not the handle, is the source of truth for how
//! much has been received, so a new handle for the same session, in this
//! process or after a restart, sees exactly what was persisted.
//!
//! ```text
//! open --write/seek/read_from--> open
//! open --finish(matching digest)--> finished   (bytes moved to blobs/, session removed)
//! open --finish(other digest)----> failed      (record kept until reaped)
//! open --cancel------------------> cancelled   (session removed)
//! ```

use std::io::SeekFrom;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, BufReader};
use uuid::Uuid;

use crate::blob::{BlobStore, Lease, not_found_as, read_object, write_object};
use crate::digest::{Digest, Verifier};
use crate::error::{RegistryError, RegistryResult};
use crate::layer::Layer;
use crate::paths;
use crate::repository::RepositoryName;

/// Persisted state of an upload session.
///
/// Finished and cancelled sessions are removed outright, so only the states a
/// stored session can be in are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Accepting writes.
    Open,
    /// Finish saw a digest mismatch; the bytes are never promoted.
    Failed,
}

/// The JSON record stored beside an upload's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionRecord {
    pub(crate) uuid: Uuid,
    pub(crate) repository: String,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) state: UploadState,
}

impl SessionRecord {
    pub(crate) async fn load(
        blobs: &BlobStore,
        path: &Utf8Path,
    ) -> RegistryResult<Option<SessionRecord>> {
        let Some(data) = read_object(blobs.storage(), path).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|err| RegistryError::Corrupt {
                path: path.to_string(),
                reason: err.to_string(),
            })
    }

    async fn store(&self, blobs: &BlobStore, path: &Utf8Path) -> RegistryResult<()> {
        let data = serde_json::to_vec(self).map_err(|err| RegistryError::Corrupt {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
        write_object(blobs.storage(), path, &data).await
    }
}

/// A handle to an in-progress layer upload.
///
/// Writes may overwrite bytes already received or append at the end; the
/// cursor can never move past the persisted size. The handle holds an
/// exclusive lease on its session until it is finished, cancelled, closed or
/// dropped.
#[derive(Debug)]
pub struct LayerUpload {
    blobs: BlobStore,
    repository: RepositoryName,
    uuid: Uuid,
    started_at: DateTime<Utc>,
    dir: Utf8PathBuf,
    offset: u64,
    size: u64,
    _lease: Lease,
}

impl LayerUpload {
    pub(crate) async fn start(blobs: BlobStore, repository: RepositoryName) -> RegistryResult<Self> {
        let uuid = Uuid::new_v4();
        let lease = blobs.lease(uuid)?;
        let dir = paths::upload_dir(&repository, &uuid);

        // Data before record: a record always has bytes beside it.
        let mut empty: &[u8] = &[];
        blobs
            .storage()
            .write_at(&paths::upload_data(&dir), 0, &mut empty)
            .await?;

        let record = SessionRecord {
            uuid,
            repository: repository.to_string(),
            started_at: Utc::now(),
            state: UploadState::Open,
        };
        record.store(&blobs, &paths::upload_record(&dir)).await?;
        tracing::debug!(%uuid, "upload started");

        Ok(Self {
            blobs,
            repository,
            uuid,
            started_at: record.started_at,
            dir,
            offset: 0,
            size: 0,
            _lease: lease,
        })
    }

    pub(crate) async fn resume(
        blobs: BlobStore,
        repository: RepositoryName,
        uuid: &str,
    ) -> RegistryResult<Self> {
        let uuid = Uuid::parse_str(uuid).map_err(|_| RegistryError::InvalidUuid(uuid.to_string()))?;
        let lease = blobs.lease(uuid)?;
        let dir = paths::upload_dir(&repository, &uuid);

        let record = SessionRecord::load(&blobs, &paths::upload_record(&dir))
            .await?
            .ok_or(RegistryError::UploadNotFound(uuid))?;
        if record.state != UploadState::Open {
            return Err(RegistryError::InvalidSession {
                uuid,
                reason: "failed",
            });
        }

        let size = blobs
            .storage()
            .metadata(&paths::upload_data(&dir))
            .await
            .map_err(|err| not_found_as(err, || RegistryError::UploadNotFound(uuid)))?
            .size;
        tracing::debug!(%uuid, size, "upload resumed");

        Ok(Self {
            blobs,
            repository,
            uuid,
            started_at: record.started_at,
            dir,
            offset: size,
            size,
            _lease: lease,
        })
    }

    /// The session identifier.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// When the session was opened.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The repository this session uploads into.
    pub fn repository(&self) -> &RepositoryName {
        &self.repository
    }

    /// Current write cursor.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes durably received.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn data(&self) -> Utf8PathBuf {
        paths::upload_data(&self.dir)
    }

    /// Move the write cursor. The target must lie within `[0, size]`.
    pub fn seek(&mut self, position: SeekFrom) -> RegistryResult<u64> {
        let target = match position {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(delta) => i128::from(self.offset) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.size) + i128::from(delta),
        };

        if target < 0 || target > i128::from(self.size) {
            return Err(RegistryError::InvalidArgument(format!(
                "seek to {target} outside of upload {} ({} bytes received)",
                self.uuid, self.size
            )));
        }

        self.offset = target as u64;
        Ok(self.offset)
    }

    /// Write `buf` at the cursor, returning the number of bytes written.
    #[tracing::instrument(skip(self, buf), fields(uuid = %self.uuid, offset = self.offset, len = buf.len()))]
    pub async fn write(&mut self, buf: &[u8]) -> RegistryResult<usize> {
        let mut reader = buf;
        let written = self.write_from(&mut reader).await?;
        Ok(written as usize)
    }

    /// Copy everything from `reader` into the session at the cursor.
    #[tracing::instrument(skip(self, reader), fields(uuid = %self.uuid, offset = self.offset))]
    pub async fn read_from<R>(&mut self, reader: R) -> RegistryResult<u64>
    where
        R: AsyncRead + Unpin + Send + Sync,
    {
        let mut reader = BufReader::new(reader);
        self.write_from(&mut reader).await
    }

    async fn write_from<R>(&mut self, reader: &mut R) -> RegistryResult<u64>
    where
        R: tokio::io::AsyncBufRead + Unpin + Send + Sync,
    {
        let result = self
            .blobs
            .storage()
            .write_at(&self.data(), self.offset, reader)
            .await;
        let written = match result {
            Ok(written) => written,
            Err(err) => {
                self.resync().await;
                return Err(err.into());
            }
        };
        self.offset += written;
        self.size = self.size.max(self.offset);
        tracing::trace!(uuid = %self.uuid, written, size = self.size, "upload progressed");
        Ok(written)
    }

    /// Re-read the persisted size after a failed write, which may have left
    /// part of its bytes behind.
    async fn resync(&mut self) {
        match self.blobs.storage().metadata(&self.data()).await {
            Ok(metadata) => {
                self.size = metadata.size;
                self.offset = self.offset.min(self.size);
                tracing::debug!(uuid = %self.uuid, size = self.size, "upload size resynced");
            }
            Err(err) => {
                tracing::warn!(uuid = %self.uuid, "cannot resync upload size: {err}");
            }
        }
    }

    /// Verify everything written against `expected` and commit it as a blob.
    ///
    /// On a mismatch the session is marked failed and nothing is committed
    /// under either digest.
    #[tracing::instrument(skip(self, expected), fields(uuid = %self.uuid, %expected))]
    pub async fn finish(self, expected: &Digest) -> RegistryResult<Layer> {
        let record_path = paths::upload_record(&self.dir);
        let mut record = SessionRecord::load(&self.blobs, &record_path)
            .await?
            .ok_or(RegistryError::UploadNotFound(self.uuid))?;
        if record.state != UploadState::Open {
            return Err(RegistryError::InvalidSession {
                uuid: self.uuid,
                reason: "failed",
            });
        }

        let data = self.data();
        let mut verifier = Verifier::new(expected.algorithm());
        self.blobs
            .storage()
            .download(&data, &mut verifier)
            .await
            .map_err(|err| not_found_as(err, || RegistryError::UploadNotFound(self.uuid)))?;
        let (actual, length) = verifier.finalize();

        if actual != *expected {
            tracing::warn!(%actual, length, "upload digest mismatch");
            record.state = UploadState::Failed;
            record.store(&self.blobs, &record_path).await?;
            return Err(RegistryError::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }

        self.blobs.commit(&data, expected).await?;
        // The blob is committed; a leftover record is reaped later.
        if let Err(err) = self.blobs.storage().delete_prefix(&self.dir).await {
            tracing::warn!("failed to remove finished upload: {err}");
        }
        tracing::debug!(length, "upload finished");

        self.blobs.fetch(expected).await
    }

    /// Abandon the session and discard everything it received.
    #[tracing::instrument(skip(self), fields(uuid = %self.uuid))]
    pub async fn cancel(self) -> RegistryResult<()> {
        self.blobs.storage().delete_prefix(&self.dir).await?;
        tracing::debug!("upload cancelled");
        Ok(())
    }

    /// Release the handle, keeping the session open for a later resume.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    use super::*;
    use crate::error::ErrorKind;
    use storage::{
        Driver, Metadata, MemoryStorage, Reader, Storage, StorageError, StorageErrorKind,
        TempDriver, Writer,
    };

    fn setup() -> (BlobStore, RepositoryName) {
        let storage: Storage = MemoryStorage::new().into();
        (BlobStore::new(storage.bucket("test")), "org/app".parse().unwrap())
    }

    /// Yields one chunk, then fails like a dropped connection.
    struct Interrupted(Option<&'static [u8]>);

    impl AsyncRead for Interrupted {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.0.take() {
                Some(chunk) => {
                    buf.put_slice(chunk);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "peer went away",
                ))),
            }
        }
    }

    /// In-memory driver with injectable failures.
    #[derive(Debug, Default)]
    struct Faulty {
        inner: MemoryStorage,
        /// `write_at` keeps what it wrote, then reports an error.
        partial_writes: bool,
        /// `delete_prefix` always fails.
        sticky_prefixes: bool,
    }

    impl Faulty {
        fn injected(&self, context: &'static str) -> StorageError {
            StorageError::builder(
                self.name(),
                StorageErrorKind::Io,
                io::Error::other("injected failure"),
            )
            .context(context)
            .build()
        }
    }

    #[async_trait::async_trait]
    impl Driver for Faulty {
        fn name(&self) -> &'static str {
            "faulty"
        }

        async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
            self.inner.delete(bucket, remote).await
        }

        async fn metadata(
            &self,
            bucket: &str,
            remote: &Utf8Path,
        ) -> Result<Metadata, StorageError> {
            self.inner.metadata(bucket, remote).await
        }

        async fn upload(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            reader: &mut Reader<'_>,
        ) -> Result<(), StorageError> {
            self.inner.upload(bucket, remote, reader).await
        }

        async fn download(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            writer: &mut Writer<'_>,
        ) -> Result<(), StorageError> {
            self.inner.download(bucket, remote, writer).await
        }

        async fn list(
            &self,
            bucket: &str,
            prefix: Option<&Utf8Path>,
        ) -> Result<Vec<String>, StorageError> {
            self.inner.list(bucket, prefix).await
        }

        async fn write_at(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            offset: u64,
            reader: &mut Reader<'_>,
        ) -> Result<u64, StorageError> {
            let written = self.inner.write_at(bucket, remote, offset, reader).await?;
            if self.partial_writes && written > 0 {
                return Err(self.injected("write_at"));
            }
            Ok(written)
        }

        async fn rename(
            &self,
            bucket: &str,
            from: &Utf8Path,
            to: &Utf8Path,
        ) -> Result<(), StorageError> {
            self.inner.rename(bucket, from, to).await
        }

        async fn delete_prefix(
            &self,
            bucket: &str,
            prefix: &Utf8Path,
        ) -> Result<(), StorageError> {
            if self.sticky_prefixes {
                return Err(self.injected("delete_prefix"));
            }
            self.inner.delete_prefix(bucket, prefix).await
        }
    }

    fn setup_with<D: Driver + Send + Sync + 'static>(driver: D) -> (BlobStore, RepositoryName) {
        let storage = Storage::new(driver);
        (BlobStore::new(storage.bucket("test")), "org/app".parse().unwrap())
    }

    #[tokio::test]
    async fn write_seek_and_overwrite() {
        let (blobs, repo) = setup();
        let mut upload = LayerUpload::start(blobs.clone(), repo).await.unwrap();

        assert_eq!(upload.write(b"hello world").await.unwrap(), 11);
        assert_eq!(upload.offset(), 11);

        upload.seek(SeekFrom::Start(6)).unwrap();
        upload.write(b"W").await.unwrap();
        assert_eq!(upload.offset(), 7);
        assert_eq!(upload.size(), 11);

        upload.seek(SeekFrom::End(0)).unwrap();
        upload.write(b"!").await.unwrap();

        let expected = Digest::sha256(b"hello World!");
        let layer = upload.finish(&expected).await.unwrap();
        assert_eq!(layer.length(), 12);
    }

    #[tokio::test]
    async fn seek_cannot_leave_written_prefix() {
        let (blobs, repo) = setup();
        let mut upload = LayerUpload::start(blobs, repo).await.unwrap();
        upload.write(b"abc").await.unwrap();

        for position in [SeekFrom::Start(4), SeekFrom::End(1), SeekFrom::Current(-4)] {
            assert_eq!(
                upload.seek(position).unwrap_err().kind(),
                ErrorKind::InvalidArgument
            );
        }
        assert_eq!(upload.offset(), 3);
        assert_eq!(upload.seek(SeekFrom::Current(-3)).unwrap(), 0);
    }

    #[tokio::test]
    async fn read_from_ingests_a_stream() {
        let (blobs, repo) = setup();
        let mut upload = LayerUpload::start(blobs, repo).await.unwrap();

        let payload = vec![7u8; 64 * 1024 + 3];
        let copied = upload.read_from(&payload[..]).await.unwrap();
        assert_eq!(copied, payload.len() as u64);

        let layer = upload.finish(&Digest::sha256(&payload)).await.unwrap();
        assert_eq!(layer.length(), payload.len() as u64);
    }

    #[tokio::test]
    async fn resume_observes_persisted_size() {
        let (blobs, repo) = setup();
        let mut upload = LayerUpload::start(blobs.clone(), repo.clone()).await.unwrap();
        let uuid = upload.uuid();
        let started_at = upload.started_at();
        upload.write(b"first half ").await.unwrap();
        upload.close();

        let mut resumed = LayerUpload::resume(blobs, repo, &uuid.to_string())
            .await
            .unwrap();
        assert_eq!(resumed.size(), 11);
        assert_eq!(resumed.offset(), 11);
        assert_eq!(resumed.started_at(), started_at);

        resumed.write(b"second half").await.unwrap();
        resumed
            .finish(&Digest::sha256(b"first half second half"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn live_handles_block_resume() {
        let (blobs, repo) = setup();
        let upload = LayerUpload::start(blobs.clone(), repo.clone()).await.unwrap();
        let uuid = upload.uuid().to_string();

        let err = LayerUpload::resume(blobs.clone(), repo.clone(), &uuid)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSession);

        drop(upload);
        LayerUpload::resume(blobs, repo, &uuid).await.unwrap();
    }

    #[tokio::test]
    async fn mismatch_marks_session_failed() {
        let (blobs, repo) = setup();
        let mut upload = LayerUpload::start(blobs.clone(), repo.clone()).await.unwrap();
        let uuid = upload.uuid();
        upload.write(b"actual bytes").await.unwrap();

        let claimed = Digest::sha256(b"claimed bytes");
        let err = upload.finish(&claimed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DigestMismatch);

        let record_path = paths::upload_record(&paths::upload_dir(&repo, &uuid));
        let record = SessionRecord::load(&blobs, &record_path)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, UploadState::Failed);

        let err = LayerUpload::resume(blobs.clone(), repo, &uuid.to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSession);

        assert!(!blobs.exists(&claimed).await.unwrap());
        assert!(!blobs.exists(&Digest::sha256(b"actual bytes")).await.unwrap());
    }

    #[tokio::test]
    async fn resume_rejects_unknown_and_malformed_ids() {
        let (blobs, repo) = setup();
        let err = LayerUpload::resume(blobs.clone(), repo.clone(), &Uuid::new_v4().to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = LayerUpload::resume(blobs, repo, "not-a-uuid")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn sessions_belong_to_their_repository() {
        let (blobs, repo) = setup();
        let upload = LayerUpload::start(blobs.clone(), repo).await.unwrap();
        let uuid = upload.uuid().to_string();
        upload.close();

        let other: RepositoryName = "org/other".parse().unwrap();
        let err = LayerUpload::resume(blobs, other, &uuid).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn interrupted_stream_leaves_session_usable() {
        let (blobs, repo) = setup_with(TempDriver::new().unwrap());
        let mut upload = LayerUpload::start(blobs, repo).await.unwrap();
        upload.write(b"head").await.unwrap();

        let err = upload
            .read_from(Interrupted(Some(b"XXXXX")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert_eq!(upload.size(), 4);
        assert_eq!(upload.offset(), 4);

        upload.seek(SeekFrom::End(0)).unwrap();
        upload.write(b"abc").await.unwrap();
        let layer = upload.finish(&Digest::sha256(b"headabc")).await.unwrap();
        assert_eq!(layer.length(), 7);
    }

    #[tokio::test]
    async fn failed_write_tracks_bytes_that_landed() {
        let driver = Faulty {
            partial_writes: true,
            ..Default::default()
        };
        let (blobs, repo) = setup_with(driver);
        let mut upload = LayerUpload::start(blobs.clone(), repo.clone()).await.unwrap();
        let uuid = upload.uuid();

        upload.write(b"kept").await.unwrap_err();
        assert_eq!(upload.size(), 4);
        assert_eq!(upload.offset(), 0);
        assert_eq!(upload.seek(SeekFrom::End(0)).unwrap(), 4);
        upload.close();

        let resumed = LayerUpload::resume(blobs, repo, &uuid.to_string())
            .await
            .unwrap();
        assert_eq!(resumed.size(), 4);
    }

    #[tokio::test]
    async fn finish_survives_failed_cleanup() {
        let driver = Faulty {
            sticky_prefixes: true,
            ..Default::default()
        };
        let (blobs, repo) = setup_with(driver);
        let mut upload = LayerUpload::start(blobs.clone(), repo).await.unwrap();
        upload.write(b"committed").await.unwrap();

        let digest = Digest::sha256(b"committed");
        let layer = upload.finish(&digest).await.unwrap();
        assert_eq!(layer.digest(), &digest);
        assert!(blobs.exists(&digest).await.unwrap());
    }
}
