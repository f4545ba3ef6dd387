//! Object storage trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use s3vault_common::{is_file_key, object_name, Result};

/// Server-side encryption scheme used for every vault write.
pub const SSE_KMS: &str = "aws:kms";

/// One entry of a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// Full storage key.
    pub key: String,
    /// Size in bytes, when reported.
    pub size: Option<u64>,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
    /// ETag of the stored object.
    pub etag: Option<String>,
}

impl ObjectSummary {
    /// Create a summary carrying only a key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: None,
            last_modified: None,
            etag: None,
        }
    }

    /// Whether the entry is a file and not a directory marker.
    pub fn is_file(&self) -> bool {
        is_file_key(&self.key)
    }

    /// Final path segment of the key.
    pub fn name(&self) -> &str {
        object_name(&self.key)
    }
}

/// Header metadata of a stored object.
///
/// Serialized with the storage service's own header names so that it can be
/// printed or logged as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectMetadata {
    /// Identifier of the key that encrypted the object.
    #[serde(rename = "SSEKMSKeyId", default, skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
    /// Server-side encryption scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_side_encryption: Option<String>,
    /// Content length in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    /// Content type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// ETag of the stored object.
    #[serde(rename = "ETag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectMetadata {
    /// Key identifier, if present and non-empty.
    pub fn kms_key_id(&self) -> Option<&str> {
        self.kms_key_id.as_deref().filter(|id| !id.is_empty())
    }

    /// An object is encrypted iff its header carries a non-empty key id.
    pub fn is_encrypted(&self) -> bool {
        self.kms_key_id().is_some()
    }
}

/// Object storage trait for vault backends.
///
/// Implementations wrap a single storage service; all addressing is done with
/// full storage keys, scoping is the caller's concern.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Get the backend name (e.g., "s3", "memory").
    fn name(&self) -> &str;

    /// List up to `max_keys` objects whose key starts with `prefix`.
    ///
    /// # Returns
    /// Summaries in key order. Directory markers are included; filtering is
    /// left to the caller.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: i32,
    ) -> Result<Vec<ObjectSummary>>;

    /// Fetch the header of an object without its body.
    ///
    /// # Errors
    /// - `ObjectNotFound` if the key does not exist
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata>;

    /// Fetch the body of an object, decrypted by the service.
    ///
    /// # Errors
    /// - `ObjectNotFound` if the key does not exist
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Write an object with server-side encryption pinned to `kms_key_id`.
    ///
    /// # Postconditions
    /// - Object exists at `key` and its header carries `kms_key_id`
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        kms_key_id: &str,
    ) -> Result<ObjectMetadata>;
}
