//! Signed manifests and the tag index of a repository

use std::collections::BTreeSet;

use bytes::Bytes;
use camino::Utf8Path;
use serde::Deserialize;

use crate::blob::{BlobStore, not_found_as, read_object, write_object};
use crate::config::ReferencePolicy;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::paths;
use crate::repository::{RepositoryName, validate_tag};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFields {
    schema_version: u32,
    name: String,
    tag: String,
    #[serde(default)]
    fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: Digest,
}

/// A signed image manifest as stored by the registry.
///
/// Only the fields the registry checks are decoded. The document itself is
/// kept byte for byte, so signatures embedded in it stay valid and its digest
/// is stable.
#[derive(Debug, Clone)]
pub struct SignedManifest {
    schema_version: u32,
    name: String,
    tag: String,
    layers: Vec<Digest>,
    raw: Bytes,
}

impl SignedManifest {
    /// Decode a manifest from its JSON bytes.
    pub fn from_slice(data: impl Into<Bytes>) -> RegistryResult<Self> {
        let raw = data.into();
        let fields: ManifestFields = serde_json::from_slice(&raw)
            .map_err(|err| RegistryError::InvalidManifest(err.to_string()))?;

        Ok(Self {
            schema_version: fields.schema_version,
            name: fields.name,
            tag: fields.tag,
            layers: fields.fs_layers.into_iter().map(|l| l.blob_sum).collect(),
            raw,
        })
    }

    /// Declared schema version.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Repository the manifest claims to belong to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag the manifest claims.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Layer digests in document order.
    pub fn layers(&self) -> &[Digest] {
        &self.layers
    }

    /// The manifest exactly as it was received.
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    /// Digest of the raw document.
    pub fn digest(&self) -> Digest {
        Digest::sha256(&self.raw)
    }
}

impl PartialEq for SignedManifest {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for SignedManifest {}

/// Manifests of one repository, addressed by tag.
///
/// Manifest documents are committed as ordinary blobs; a tag is a small link
/// object holding the manifest digest, so reassigning a tag is a single
/// object replacement.
#[derive(Debug, Clone)]
pub struct ManifestService {
    repository: RepositoryName,
    blobs: BlobStore,
    policy: ReferencePolicy,
}

impl ManifestService {
    pub(crate) fn new(repository: RepositoryName, blobs: BlobStore, policy: ReferencePolicy) -> Self {
        Self {
            repository,
            blobs,
            policy,
        }
    }

    /// Tags currently assigned in this repository, sorted.
    #[tracing::instrument(skip(self), fields(repository = %self.repository))]
    pub async fn tags(&self) -> RegistryResult<Vec<String>> {
        let root = paths::tags(&self.repository);
        let objects = self.blobs.storage().list(Some(&root)).await?;

        let tags: BTreeSet<String> = objects
            .iter()
            .filter_map(|object| {
                let relative = Utf8Path::new(object).strip_prefix(&root).ok()?;
                let mut components = relative.components();
                let tag = components.next()?.as_str();
                (components.next()?.as_str() == "current").then(|| tag.to_string())
            })
            .collect();
        Ok(tags.into_iter().collect())
    }

    /// Whether `tag` is assigned.
    #[tracing::instrument(skip(self), fields(repository = %self.repository))]
    pub async fn exists(&self, tag: &str) -> RegistryResult<bool> {
        validate_tag(tag)?;
        match self
            .blobs
            .storage()
            .metadata(&paths::tag_current(&self.repository, tag))
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// The manifest currently assigned to `tag`.
    #[tracing::instrument(skip(self), fields(repository = %self.repository))]
    pub async fn get(&self, tag: &str) -> RegistryResult<SignedManifest> {
        let digest = self.resolve(tag).await?;
        let data = self
            .blobs
            .read(&digest)
            .await
            .map_err(|err| match err {
                RegistryError::BlobNotFound(_) => RegistryError::Corrupt {
                    path: paths::tag_current(&self.repository, tag).to_string(),
                    reason: format!("tag points at missing manifest {digest}"),
                },
                err => err,
            })?;
        SignedManifest::from_slice(data)
    }

    /// Digest of the manifest currently assigned to `tag`.
    pub async fn resolve(&self, tag: &str) -> RegistryResult<Digest> {
        validate_tag(tag)?;
        let path = paths::tag_current(&self.repository, tag);
        let link = read_object(self.blobs.storage(), &path)
            .await?
            .ok_or_else(|| self.missing(tag))?;

        std::str::from_utf8(&link)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| RegistryError::Corrupt {
                path: path.to_string(),
                reason: "tag link is not a digest".into(),
            })
    }

    /// Store `manifest` and point `tag` at it, replacing any previous assignment.
    #[tracing::instrument(skip(self, manifest), fields(repository = %self.repository))]
    pub async fn put(&self, tag: &str, manifest: &SignedManifest) -> RegistryResult<Digest> {
        validate_tag(tag)?;
        self.validate(tag, manifest).await?;

        let digest = self.blobs.put(manifest.as_bytes()).await?;
        write_object(
            self.blobs.storage(),
            &paths::tag_current(&self.repository, tag),
            digest.to_string().as_bytes(),
        )
        .await?;
        tracing::debug!(%digest, "tag assigned");
        Ok(digest)
    }

    /// Remove the assignment of `tag`. The manifest blob itself is kept.
    #[tracing::instrument(skip(self), fields(repository = %self.repository))]
    pub async fn delete(&self, tag: &str) -> RegistryResult<()> {
        validate_tag(tag)?;
        self.blobs
            .storage()
            .delete(&paths::tag_current(&self.repository, tag))
            .await
            .map_err(|err| not_found_as(err, || self.missing(tag)))?;
        tracing::debug!("tag removed");
        Ok(())
    }

    async fn validate(&self, tag: &str, manifest: &SignedManifest) -> RegistryResult<()> {
        if manifest.schema_version() != 1 {
            return Err(RegistryError::InvalidManifest(format!(
                "unsupported schema version {}",
                manifest.schema_version()
            )));
        }
        if manifest.name() != self.repository.as_str() {
            return Err(RegistryError::InvalidManifest(format!(
                "manifest names repository {:?}, not {}",
                manifest.name(),
                self.repository
            )));
        }
        if manifest.tag() != tag {
            return Err(RegistryError::InvalidManifest(format!(
                "manifest is tagged {:?}, not {tag:?}",
                manifest.tag()
            )));
        }
        if manifest.layers().is_empty() {
            return Err(RegistryError::InvalidManifest("no layers".into()));
        }

        match self.policy {
            ReferencePolicy::Relaxed => Ok(()),
            ReferencePolicy::Enforce => {
                for layer in manifest.layers() {
                    if !self.blobs.exists(layer).await? {
                        tracing::debug!(%layer, "manifest references unknown layer");
                        return Err(RegistryError::ReferentialIntegrity(layer.clone()));
                    }
                }
                Ok(())
            }
        }
    }

    fn missing(&self, tag: &str) -> RegistryError {
        RegistryError::ManifestNotFound {
            repository: self.repository.to_string(),
            tag: tag.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use storage::{MemoryStorage, Storage};

    fn document(name: &str, tag: &str, layers: &[&Digest]) -> Vec<u8> {
        let fs_layers: Vec<_> = layers
            .iter()
            .map(|d| serde_json::json!({ "blobSum": d.to_string() }))
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 1,
            "name": name,
            "tag": tag,
            "architecture": "amd64",
            "fsLayers": fs_layers,
            "history": [],
            "signatures": [],
        }))
        .unwrap()
    }

    fn service(policy: ReferencePolicy) -> ManifestService {
        let storage: Storage = MemoryStorage::new().into();
        ManifestService::new(
            "org/app".parse().unwrap(),
            BlobStore::new(storage.bucket("test")),
            policy,
        )
    }

    #[test]
    fn parse_keeps_raw_bytes() {
        let layer = Digest::sha256(b"layer");
        let raw = document("org/app", "v1", &[&layer]);
        let manifest = SignedManifest::from_slice(raw.clone()).unwrap();

        assert_eq!(manifest.schema_version(), 1);
        assert_eq!(manifest.name(), "org/app");
        assert_eq!(manifest.tag(), "v1");
        assert_eq!(manifest.layers(), &[layer]);
        assert_eq!(manifest.as_bytes().as_ref(), raw.as_slice());
        assert_eq!(manifest.digest(), Digest::sha256(&raw));
    }

    #[test]
    fn parse_rejects_garbage() {
        for raw in [
            &b"not json"[..],
            br#"{"name": "a", "tag": "b"}"#,
            br#"{"schemaVersion": 1, "name": "a", "tag": "b", "fsLayers": [{"blobSum": "md5:00"}]}"#,
        ] {
            let err = SignedManifest::from_slice(raw.to_vec()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn put_get_and_delete() {
        let service = service(ReferencePolicy::Enforce);
        let layer = service.blobs.put(b"layer").await.unwrap();
        let manifest =
            SignedManifest::from_slice(document("org/app", "latest", &[&layer])).unwrap();

        assert!(!service.exists("latest").await.unwrap());
        let digest = service.put("latest", &manifest).await.unwrap();
        assert_eq!(digest, manifest.digest());
        assert!(service.blobs.exists(&digest).await.unwrap());

        assert!(service.exists("latest").await.unwrap());
        assert_eq!(service.get("latest").await.unwrap(), manifest);
        assert_eq!(service.resolve("latest").await.unwrap(), digest);
        assert_eq!(service.tags().await.unwrap(), vec!["latest"]);

        service.delete("latest").await.unwrap();
        assert_eq!(
            service.get("latest").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            service.delete("latest").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(service.tags().await.unwrap().is_empty());
        assert!(service.blobs.exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn put_checks_structure() {
        let service = service(ReferencePolicy::Relaxed);
        let layer = Digest::sha256(b"layer");

        let cases = [
            document("org/other", "v1", &[&layer]),
            document("org/app", "v2", &[&layer]),
            document("org/app", "v1", &[]),
            br#"{"schemaVersion": 2, "name": "org/app", "tag": "v1", "fsLayers": []}"#.to_vec(),
        ];
        for raw in cases {
            let manifest = SignedManifest::from_slice(raw).unwrap();
            let err = service.put("v1", &manifest).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }

        let manifest = SignedManifest::from_slice(document("org/app", "v1", &[&layer])).unwrap();
        let err = service.put("bad tag", &manifest).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn reference_policy() {
        let present = Digest::sha256(b"present");
        let absent = Digest::sha256(b"absent");
        let raw = document("org/app", "v1", &[&present, &absent]);
        let manifest = SignedManifest::from_slice(raw).unwrap();

        let enforcing = service(ReferencePolicy::Enforce);
        enforcing.blobs.put(b"present").await.unwrap();
        match enforcing.put("v1", &manifest).await.unwrap_err() {
            RegistryError::ReferentialIntegrity(missing) => assert_eq!(missing, absent),
            err => panic!("unexpected error: {err}"),
        }
        assert!(!enforcing.exists("v1").await.unwrap());

        let relaxed = service(ReferencePolicy::Relaxed);
        relaxed.put("v1", &manifest).await.unwrap();
        assert!(relaxed.exists("v1").await.unwrap());
    }
}
