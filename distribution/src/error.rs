//! Error types for the registry

use std::fmt;

use uuid::Uuid;

use crate::digest::Digest;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Category of a [`RegistryError`], stable enough for a transport layer to
/// map onto status codes without looking at messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A repository, tag, digest or upload session is absent.
    NotFound,
    /// Malformed repository name.
    InvalidName,
    /// Malformed identifier or parameter.
    InvalidArgument,
    /// Finish-time verification failed. Always fatal to the session.
    DigestMismatch,
    /// Operation on a failed, held or otherwise unusable session.
    InvalidSession,
    /// A manifest references a blob the registry does not hold.
    ReferentialIntegrity,
    /// The storage medium failed. Possibly retryable.
    IoFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::InvalidName => "invalid name",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::DigestMismatch => "digest mismatch",
            ErrorKind::InvalidSession => "invalid session",
            ErrorKind::ReferentialIntegrity => "referential integrity",
            ErrorKind::IoFailure => "I/O failure",
        };
        f.write_str(name)
    }
}

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// No manifest is tagged with this name
    #[error("manifest not found: {repository}:{tag}")]
    ManifestNotFound {
        /// Repository searched
        repository: String,
        /// Tag requested
        tag: String,
    },

    /// Upload session not found
    #[error("upload not found: {0}")]
    UploadNotFound(Uuid),

    /// Invalid repository name
    #[error("invalid repository name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name
        name: String,
        /// Which rule it broke
        reason: &'static str,
    },

    /// Invalid digest format
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),

    /// Invalid tag format
    #[error("invalid tag {0:?}")]
    InvalidTag(String),

    /// Upload identifiers are UUIDs
    #[error("invalid upload id {0:?}")]
    InvalidUuid(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Any other malformed parameter
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest claimed by the caller
        expected: Digest,
        /// Digest of the bytes actually written
        actual: Digest,
    },

    /// The session exists but cannot be used
    #[error("upload {uuid} is {reason}")]
    InvalidSession {
        /// Session identifier
        uuid: Uuid,
        /// Why it cannot be used
        reason: &'static str,
    },

    /// Manifest references a blob that is not in the store
    #[error("manifest references unknown blob {0}")]
    ReferentialIntegrity(Digest),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Registry bookkeeping could not be decoded
    #[error("corrupt record at {path}: {reason}")]
    Corrupt {
        /// Object path of the record
        path: String,
        /// Decoding failure
        reason: String,
    },

    /// Configuration could not be parsed
    #[error("configuration: {0}")]
    Config(#[from] toml_edit::de::Error),
}

impl RegistryError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound { .. }
            | RegistryError::UploadNotFound(_) => ErrorKind::NotFound,
            RegistryError::InvalidName { .. } => ErrorKind::InvalidName,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::InvalidUuid(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidArgument(_)
            | RegistryError::Config(_) => ErrorKind::InvalidArgument,
            RegistryError::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            RegistryError::InvalidSession { .. } => ErrorKind::InvalidSession,
            RegistryError::ReferentialIntegrity(_) => ErrorKind::ReferentialIntegrity,
            RegistryError::Storage(_) | RegistryError::Corrupt { .. } => ErrorKind::IoFailure,
        }
    }

    /// Whether repeating the same call may succeed.
    ///
    /// Only transient storage failures qualify; structural errors need the
    /// input corrected first.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound { .. } => "MANIFEST_UNKNOWN",
            RegistryError::UploadNotFound(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::InvalidName { .. } => "NAME_INVALID",
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::ReferentialIntegrity(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::InvalidUuid(_) | RegistryError::InvalidSession { .. } => {
                "BLOB_UPLOAD_INVALID"
            }
            RegistryError::InvalidArgument(_)
            | RegistryError::Config(_)
            | RegistryError::Storage(_)
            | RegistryError::Corrupt { .. } => "UNKNOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{StorageError, StorageErrorKind};

    #[test]
    fn kinds_follow_variants() {
        let digest = Digest::sha256(b"");
        assert_eq!(
            RegistryError::BlobNotFound(digest.clone()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            RegistryError::DigestMismatch {
                expected: digest.clone(),
                actual: Digest::sha256(b"x"),
            }
            .kind(),
            ErrorKind::DigestMismatch
        );
        assert_eq!(
            RegistryError::InvalidTag("-".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            RegistryError::ReferentialIntegrity(digest).error_code(),
            "MANIFEST_BLOB_UNKNOWN"
        );
    }

    #[test]
    fn only_transient_storage_errors_retry() {
        let transient = RegistryError::from(StorageError::new(
            "test",
            StorageErrorKind::ServiceUnavailable,
            std::io::Error::other("busy"),
        ));
        assert_eq!(transient.kind(), ErrorKind::IoFailure);
        assert!(transient.is_retryable());

        let denied = RegistryError::from(StorageError::new(
            "test",
            StorageErrorKind::PermissionDenied,
            std::io::Error::other("nope"),
        ));
        assert!(!denied.is_retryable());
        assert!(!RegistryError::InvalidDigest("x".into()).is_retryable());
    }
}
