//! Repository names and the per-repository service aggregate

use std::fmt;
use std::str::FromStr;

use crate::blob::BlobStore;
use crate::config::ReferencePolicy;
use crate::error::{RegistryError, RegistryResult};
use crate::layer::LayerService;
use crate::manifest::ManifestService;
use crate::signature::SignatureService;

const MAX_NAME_LENGTH: usize = 255;

/// A validated, hierarchical repository name such as `org/image`.
///
/// Each `/`-separated component is lowercase alphanumerics, optionally
/// joined by a single `.`, a single `_`, a double `__`, or a run of `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryName(String);

impl RepositoryName {
    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RepositoryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RepositoryName {
    type Err = RegistryError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| RegistryError::InvalidName {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("empty"));
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(invalid("longer than 255 characters"));
        }
        for component in name.split('/') {
            if component.is_empty() {
                return Err(invalid("empty path component"));
            }
            if !valid_component(component) {
                return Err(invalid("invalid path component"));
            }
        }

        Ok(RepositoryName(name.to_string()))
    }
}

fn is_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    if !bytes.first().copied().is_some_and(is_alnum) || !bytes.last().copied().is_some_and(is_alnum)
    {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if is_alnum(bytes[i]) {
            i += 1;
            continue;
        }

        let start = i;
        while i < bytes.len() && !is_alnum(bytes[i]) {
            i += 1;
        }
        match &component[start..i] {
            "." | "_" | "__" => {}
            run if run.bytes().all(|b| b == b'-') => {}
            _ => return false,
        }
    }
    true
}

/// Validate a tag: a word character followed by up to 127 word characters,
/// `.` or `-`.
pub(crate) fn validate_tag(tag: &str) -> RegistryResult<()> {
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let bytes = tag.as_bytes();
    let valid = !bytes.is_empty()
        && bytes.len() <= 128
        && word(bytes[0])
        && bytes[1..].iter().all(|&b| word(b) || b == b'.' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTag(tag.to_string()))
    }
}

/// A named collection of manifests, layers and signatures.
///
/// A repository owns no bytes itself: obtaining one never touches storage, and
/// whether it has any content is answered by its services.
#[derive(Debug, Clone)]
pub struct Repository {
    name: RepositoryName,
    blobs: BlobStore,
    policy: ReferencePolicy,
}

impl Repository {
    pub(crate) fn new(name: RepositoryName, blobs: BlobStore, policy: ReferencePolicy) -> Self {
        Self {
            name,
            blobs,
            policy,
        }
    }

    /// The name of this repository.
    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    /// Tagged manifests.
    pub fn manifests(&self) -> ManifestService {
        ManifestService::new(self.name.clone(), self.blobs.clone(), self.policy)
    }

    /// Layer blobs and uploads.
    pub fn layers(&self) -> LayerService {
        LayerService::new(self.name.clone(), self.blobs.clone())
    }

    /// Detached signatures.
    pub fn signatures(&self) -> SignatureService {
        SignatureService::new(self.name.clone(), self.blobs.clone())
    }
}
