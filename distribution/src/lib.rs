//! # Artifact registry storage
//!
//! The storage core of a container artifact registry: a content-addressable
//! blob store with resumable, digest-verified uploads, and per-repository
//! tagged manifests and detached signatures.
//!
//! ## Features
//!
//! - Blobs are admitted only after their digest is recomputed from the stored bytes
//! - Upload sessions survive restarts; the storage backend tracks progress
//! - Identical concurrent uploads commit exactly one blob
//! - Pluggable storage backend via the `storage` crate
//! - Periodic purging of abandoned uploads
//!
//! ## Example
//!
//! ```no_run
//! use distribution::{Digest, Registry};
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::builder()
//!     .storage(MemoryStorage::new().into())
//!     .bucket("registry")
//!     .build()?;
//!
//! let repository = registry.repository("library/hello")?;
//! let mut upload = repository.layers().upload().await?;
//! upload.write(b"hello, world").await?;
//! let layer = upload.finish(&Digest::sha256(b"hello, world")).await?;
//! assert_eq!(layer.length(), 12);
//! # Ok(())
//! # }
//! ```

mod blob;
mod config;
mod descriptor;
mod digest;
mod error;
mod layer;
mod manifest;
mod paths;
mod reaper;
mod registry;
mod repository;
mod signature;
mod upload;

pub use blob::BlobStore;
pub use config::{ReferencePolicy, RegistryConfig, UploadConfig};
pub use descriptor::{Descriptor, OCTET_STREAM};
pub use digest::{Algorithm, Digest, Digester, Verifier};
pub use error::{ErrorKind, RegistryError, RegistryResult};
pub use layer::{Layer, LayerService};
pub use manifest::{ManifestService, SignedManifest};
pub use reaper::PurgeReport;
pub use registry::{Registry, RegistryBuilder};
pub use repository::{Repository, RepositoryName};
pub use signature::SignatureService;
pub use upload::{LayerUpload, UploadState};
