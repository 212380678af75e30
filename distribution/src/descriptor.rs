use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Media type of blobs whose content type is not otherwise known.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Describes a blob independently of where it is stored.
///
/// This is also the wire format. Fields may be added but never repurposed or
/// removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Content type; text formats are utf-8.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,

    /// Length of the content in bytes.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub length: u64,

    /// Identifies the content; a byte stream can be verified against it.
    pub digest: Digest,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl Descriptor {
    /// Describe an untyped blob.
    pub fn blob(digest: Digest, length: u64) -> Self {
        Self {
            media_type: OCTET_STREAM.to_string(),
            length,
            digest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_camel_case() {
        let digest = Digest::sha256(b"abc");
        let descriptor = Descriptor::blob(digest.clone(), 3);
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "mediaType": "application/octet-stream",
                "length": 3,
                "digest": digest.to_string(),
            })
        );
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let digest = Digest::sha256(b"");
        let json = format!(r#"{{"digest":"{digest}","annotations":{{"a":"b"}}}}"#);
        let descriptor: Descriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(descriptor.length, 0);
        assert!(descriptor.media_type.is_empty());
        assert_eq!(descriptor.digest, digest);
    }
}
