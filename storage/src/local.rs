use std::io::{self, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Storage driver backed by a directory on the local filesystem.
///
/// Objects live under `<root>/<bucket>/b/`. Whole-object uploads are staged in
/// `<root>/<bucket>/t/` and renamed into place, so they appear atomically.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. Directories are created on demand.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn objects(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        self.objects(bucket).join(remote)
    }

    fn staging(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("t");
        path.push(format!(
            "{}-{}",
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        path
    }

    fn error<'a>(
        &self,
        bucket: &'a str,
        remote: &'a Utf8Path,
        context: &'static str,
    ) -> impl FnOnce(io::Error) -> StorageError + 'a {
        let engine = self.name();
        move |err| {
            StorageError::io(engine, err)
                .bucket(bucket)
                .path(remote.as_str())
                .context(context)
                .build()
        }
    }

    async fn create_parent(&self, path: &Utf8Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let metadata = tokio::fs::metadata(self.path(bucket, remote))
            .await
            .map_err(self.error(bucket, remote, "metadata"))?;
        // Not every filesystem records birth time.
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(self.error(bucket, remote, "timestamps"))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        tokio::fs::remove_file(self.path(bucket, remote))
            .await
            .map_err(self.error(bucket, remote, "remove_file"))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let target = self.path(bucket, remote);
        let staged = self.staging(bucket);

        self.create_parent(&target)
            .await
            .map_err(self.error(bucket, remote, "create_dir_all"))?;
        self.create_parent(&staged)
            .await
            .map_err(self.error(bucket, remote, "create staging dir"))?;

        let result = async {
            let mut writer = tokio::io::BufWriter::new(tokio::fs::File::create(&staged).await?);
            tokio::io::copy(local, &mut writer).await?;
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
            tokio::fs::rename(&staged, &target).await
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&staged).await;
        }
        result.map_err(self.error(bucket, remote, "upload"))
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(self.path(bucket, remote))
                .await
                .map_err(self.error(bucket, remote, "open remote file"))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(self.error(bucket, remote, "copy"))?;

        local
            .flush()
            .await
            .map_err(self.error(bucket, remote, "flush writer"))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.objects(bucket);
        let start = match prefix {
            Some(prefix) => base.join(prefix),
            None => base.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&base, &start))
            .in_current_span()
            .await
            .map_err(|err| StorageError::new(self.name(), StorageErrorKind::Other, err))?
            .map_err(|err| {
                StorageError::io(self.name(), err)
                    .bucket(bucket)
                    .context("list")
                    .build()
            })?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items.into_iter().map(|p| p.to_string()).collect())
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let target = self.path(bucket, remote);
        if offset == 0 {
            self.create_parent(&target)
                .await
                .map_err(self.error(bucket, remote, "create_dir_all"))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(offset == 0)
            .truncate(false)
            .open(&target)
            .await
            .map_err(self.error(bucket, remote, "open for write"))?;

        let len = file
            .metadata()
            .await
            .map_err(self.error(bucket, remote, "metadata"))?
            .len();
        if offset > len {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("offset {offset} is beyond the end of the object ({len} bytes)"),
                ),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .context("write_at")
            .build());
        }

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(self.error(bucket, remote, "seek"))?;
        let written = match tokio::io::copy_buf(reader, &mut file).await {
            Ok(written) => written,
            Err(err) => {
                // Drop whatever part of the write landed past the old end.
                if let Err(truncate) = file.set_len(len).await {
                    tracing::warn!(%remote, "failed to truncate after partial write: {truncate}");
                }
                return Err(self.error(bucket, remote, "write")(err));
            }
        };
        file.flush()
            .await
            .map_err(self.error(bucket, remote, "flush"))?;
        file.sync_data()
            .await
            .map_err(self.error(bucket, remote, "sync"))?;

        Ok(written)
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let target = self.path(bucket, to);
        self.create_parent(&target)
            .await
            .map_err(self.error(bucket, to, "create_dir_all"))?;
        tokio::fs::rename(self.path(bucket, from), &target)
            .await
            .map_err(self.error(bucket, from, "rename"))
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &Utf8Path) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(self.path(bucket, prefix)).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result.map_err(self.error(bucket, prefix, "remove_dir_all")),
        }
    }
}

#[tracing::instrument]
fn collect_list(base: &Utf8Path, start: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    match start.metadata() {
        Ok(meta) if meta.is_dir() => visit(start, &mut files)?,
        Ok(_) => files.push(start.to_owned()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_owned()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, ReadBuf};

    use super::*;

    /// Yields one chunk, then fails.
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

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn upload_is_visible_only_under_objects() {
        let (_dir, driver) = driver();
        let mut data: &[u8] = b"blob";
        driver
            .upload("reg", Utf8Path::new("blobs/sha256/aa/data"), &mut data)
            .await
            .unwrap();

        assert_eq!(
            driver.list("reg", None).await.unwrap(),
            vec!["blobs/sha256/aa/data"]
        );
        let meta = driver
            .metadata("reg", Utf8Path::new("blobs/sha256/aa/data"))
            .await
            .unwrap();
        assert_eq!(meta.size, 4);
    }

    #[tokio::test]
    async fn write_at_persists_across_drivers() {
        let (dir, driver) = driver();
        let path = Utf8Path::new("uploads/u/data");

        let mut chunk: &[u8] = b"hello ";
        driver.write_at("reg", path, 0, &mut chunk).await.unwrap();
        drop(driver);

        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let reopened = LocalDriver::new(root);
        let size = reopened.metadata("reg", path).await.unwrap().size;
        assert_eq!(size, 6);

        let mut chunk: &[u8] = b"world";
        reopened
            .write_at("reg", path, size, &mut chunk)
            .await
            .unwrap();

        let mut out = Vec::new();
        reopened.download("reg", path, &mut out).await.unwrap();
        assert_eq!(out, b"hello world");

        let mut chunk: &[u8] = b"!";
        let err = reopened
            .write_at("reg", path, 100, &mut chunk)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn missing_paths_report_not_found() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("nope");
        assert!(driver.metadata("reg", path).await.unwrap_err().is_not_found());
        assert!(driver.delete("reg", path).await.unwrap_err().is_not_found());
        assert!(driver
            .rename("reg", path, Utf8Path::new("elsewhere"))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(driver
            .list("reg", Some(Utf8Path::new("no/such/prefix")))
            .await
            .unwrap()
            .is_empty());
        driver.delete_prefix("reg", path).await.unwrap();
    }

    #[tokio::test]
    async fn rename_and_delete_prefix() {
        let (_dir, driver) = driver();
        let mut data: &[u8] = b"bytes";
        driver
            .write_at("reg", Utf8Path::new("up/1/data"), 0, &mut data)
            .await
            .unwrap();
        driver
            .rename("reg", Utf8Path::new("up/1/data"), Utf8Path::new("blobs/x/data"))
            .await
            .unwrap();
        driver
            .delete_prefix("reg", Utf8Path::new("up"))
            .await
            .unwrap();

        assert_eq!(driver.list("reg", None).await.unwrap(), vec!["blobs/x/data"]);
    }

    #[tokio::test]
    async fn failed_write_at_keeps_previous_length() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("uploads/u/data");

        let mut head: &[u8] = b"head";
        driver.write_at("reg", path, 0, &mut head).await.unwrap();

        let mut reader = tokio::io::BufReader::new(Interrupted(Some(b"XXXXXXXX")));
        driver
            .write_at("reg", path, 4, &mut reader)
            .await
            .unwrap_err();

        assert_eq!(driver.metadata("reg", path).await.unwrap().size, 4);
        let mut out = Vec::new();
        driver.download("reg", path, &mut out).await.unwrap();
        assert_eq!(out, b"head");
    }
}
