//! Registry entry point and builder

use storage::Storage;
use tokio::task::JoinHandle;

use crate::blob::BlobStore;
use crate::config::{DEFAULT_BUCKET, ReferencePolicy, RegistryConfig, UploadConfig};
use crate::error::{RegistryError, RegistryResult};
use crate::reaper;
use crate::repository::{Repository, RepositoryName};

/// An artifact registry over one storage bucket.
///
/// Cloning is cheap and clones share state: commit serialization and upload
/// leases are scoped to the instance created by [`RegistryBuilder::build`].
#[derive(Debug, Clone)]
pub struct Registry {
    blobs: BlobStore,
    policy: ReferencePolicy,
}

impl Registry {
    /// Start configuring a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Build the configured storage backend and a registry over it.
    ///
    /// Upload reaping is not started here, see [`Registry::spawn_upload_reaper`].
    #[tracing::instrument(skip(config))]
    pub fn from_config(config: RegistryConfig) -> RegistryResult<Self> {
        let storage = config.storage.build()?;
        RegistryBuilder::new()
            .storage(storage)
            .bucket(config.bucket)
            .reference_policy(config.reference_policy)
            .build()
    }

    /// Look up a repository by name.
    ///
    /// Only the name is checked. Whether the repository holds anything is
    /// answered by its services.
    pub fn repository(&self, name: &str) -> RegistryResult<Repository> {
        let name: RepositoryName = name.parse()?;
        Ok(Repository::new(name, self.blobs.clone(), self.policy))
    }

    /// The blob store shared by every repository.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Periodically purge abandoned upload sessions.
    ///
    /// Runs until the returned handle is aborted. Must be called from within a
    /// tokio runtime.
    pub fn spawn_upload_reaper(&self, config: UploadConfig) -> JoinHandle<()> {
        reaper::spawn(self.blobs.clone(), config)
    }
}

/// Registry builder
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    storage: Option<Storage>,
    bucket: Option<String>,
    reference_policy: ReferencePolicy,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set how manifest writes treat unknown layers
    pub fn reference_policy(mut self, policy: ReferencePolicy) -> Self {
        self.reference_policy = policy;
        self
    }

    /// Build the registry
    pub fn build(self) -> RegistryResult<Registry> {
        let storage = self.storage.ok_or_else(|| {
            RegistryError::InvalidArgument("storage backend must be configured".into())
        })?;
        let bucket = self.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        tracing::debug!(driver = storage.name(), %bucket, policy = ?self.reference_policy, "registry ready");

        Ok(Registry {
            blobs: BlobStore::new(storage.bucket(bucket)),
            policy: self.reference_policy,
        })
    }
}
