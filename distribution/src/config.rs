//! Registry configuration
//!
//! ```toml
//! bucket = "registry"
//! reference-policy = "enforce"
//!
//! [storage.local]
//! path = "/var/lib/registry"
//!
//! [uploads]
//! max-age-secs = 604800
//! purge-interval-secs = 86400
//! purge = true
//! ```

use std::time::Duration;

use serde::Deserialize;
use storage::StorageConfig;

use crate::error::RegistryResult;

pub(crate) const DEFAULT_BUCKET: &str = "registry";

/// Whether manifest writes check that every referenced layer is committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferencePolicy {
    /// Reject manifests that reference unknown layers.
    #[default]
    Enforce,
    /// Accept manifests as long as they are well formed. Layers may be pushed
    /// afterwards, or never.
    Relaxed,
}

/// Reaping of abandoned upload sessions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UploadConfig {
    /// Open sessions older than this are purged.
    pub max_age_secs: u64,

    /// Time between sweeps.
    pub purge_interval_secs: u64,

    /// Whether the sweep runs at all.
    pub purge: bool,
}

impl UploadConfig {
    /// Maximum session age as a duration.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Sweep interval as a duration.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 7 * 24 * 60 * 60,
            purge_interval_secs: 24 * 60 * 60,
            purge: true,
        }
    }
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

/// Everything needed to construct a [`crate::Registry`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Storage backend.
    pub storage: StorageConfig,

    /// Bucket holding all registry objects.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Manifest reference checking.
    #[serde(default)]
    pub reference_policy: ReferencePolicy,

    /// Upload session reaping.
    #[serde(default)]
    pub uploads: UploadConfig,
}

impl RegistryConfig {
    /// Parse a TOML document.
    pub fn from_toml(input: &str) -> RegistryResult<Self> {
        Ok(toml_edit::de::from_str(input)?)
    }
}
