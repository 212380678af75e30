//! Object layout inside the registry bucket
//!
//! ```text
//! blobs/<algorithm>/<hex>/data
//! repositories/<name>/_uploads/<uuid>/{data,record}
//! repositories/<name>/_manifests/tags/<tag>/current
//! repositories/<name>/_signatures/<algorithm>/<hex>/<algorithm>/<hex>
//! ```
//!
//! Repository name components never start with `_`, so the reserved
//! directories cannot collide with a nested repository.

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use crate::digest::Digest;
use crate::repository::RepositoryName;

const REPOSITORIES: &str = "repositories";
const UPLOADS: &str = "_uploads";

pub(crate) fn blob_data(digest: &Digest) -> Utf8PathBuf {
    Utf8PathBuf::from(format!(
        "blobs/{}/{}/data",
        digest.algorithm(),
        digest.hex()
    ))
}

pub(crate) fn repositories() -> &'static Utf8Path {
    Utf8Path::new(REPOSITORIES)
}

fn repository(name: &RepositoryName) -> Utf8PathBuf {
    Utf8Path::new(REPOSITORIES).join(name.as_str())
}

pub(crate) fn upload_dir(name: &RepositoryName, uuid: &Uuid) -> Utf8PathBuf {
    let mut path = repository(name);
    path.push(UPLOADS);
    path.push(uuid.to_string());
    path
}

pub(crate) fn upload_data(dir: &Utf8Path) -> Utf8PathBuf {
    dir.join("data")
}

pub(crate) fn upload_record(dir: &Utf8Path) -> Utf8PathBuf {
    dir.join("record")
}

pub(crate) fn tags(name: &RepositoryName) -> Utf8PathBuf {
    let mut path = repository(name);
    path.push("_manifests");
    path.push("tags");
    path
}

pub(crate) fn tag_current(name: &RepositoryName, tag: &str) -> Utf8PathBuf {
    let mut path = tags(name);
    path.push(tag);
    path.push("current");
    path
}

pub(crate) fn signatures(name: &RepositoryName, digest: &Digest) -> Utf8PathBuf {
    let mut path = repository(name);
    path.push("_signatures");
    path.push(digest.algorithm().as_str());
    path.push(digest.hex());
    path
}

pub(crate) fn signature(name: &RepositoryName, digest: &Digest, signature: &Digest) -> Utf8PathBuf {
    let mut path = signatures(name, digest);
    path.push(signature.algorithm().as_str());
    path.push(signature.hex());
    path
}

/// Recover the upload directory and session id from any object path inside it.
pub(crate) fn parse_upload_path(path: &str) -> Option<(Utf8PathBuf, Uuid)> {
    let marker = format!("/{UPLOADS}/");
    let start = path.find(&marker)? + marker.len();
    let id = path[start..].split('/').next()?;
    let uuid = Uuid::parse_str(id).ok()?;
    Some((Utf8PathBuf::from(&path[..start + id.len()]), uuid))
}
