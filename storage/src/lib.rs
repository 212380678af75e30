//! # Storage backends
//!
//! Configuration and unification for the storage backends.

use std::sync::Arc;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Selects a storage backend at construction time.
///
/// ```toml
/// [storage.local]
/// path = "/var/lib/registry"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Process-local storage, lost on exit.
    Memory,

    /// A directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory, created on demand.
        path: Utf8PathBuf,
    },

    /// A fresh temporary directory, removed when the storage is dropped.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(|err| StorageError::io("temp", err).context("create temp dir").build())?
                .into(),
        };
        tracing::debug!(driver = client.name(), "storage backend ready");
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Bind this storage to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }
}

/// A storage driver bound to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket every operation targets.
    pub bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The name of the underlying driver.
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Object metadata.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Download an object into a writer.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {}/{remote}", self.bucket);
        self.driver.download(&self.bucket, remote, writer).await
    }

    /// Upload a whole object from a reader.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn upload<'d, R>(
        &'d self,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver.upload(&self.bucket, remote, reader).await
    }

    /// Positional write, see [`Driver::write_at`].
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn write_at<'d, R>(
        &'d self,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut R,
    ) -> Result<u64, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        self.driver
            .write_at(&self.bucket, remote, offset, reader)
            .await
    }

    /// Move an object, replacing the destination.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.driver.rename(&self.bucket, from, to).await
    }

    /// List objects below a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }

    /// Delete a single object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, path).await
    }

    /// Delete every object below a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn delete_prefix(&self, prefix: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete_prefix(&self.bucket, prefix).await
    }
}
