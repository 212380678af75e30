use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Driver, Metadata, Reader, StorageError, Writer};

/// A storage driver that stores objects in a temporary directory, removed
/// when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing objects in a fresh temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("temporary directory is not utf-8: {}", path.display()),
            )
        })?;

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }

    /// The directory backing this driver.
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.driver.upload(bucket, remote, local).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.driver.download(bucket, remote, local).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.driver.write_at(bucket, remote, offset, reader).await
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.driver.rename(bucket, from, to).await
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete_prefix(bucket, prefix).await
    }
}
