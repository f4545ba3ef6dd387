//! In-memory object storage for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::provider::{ObjectMetadata, ObjectStorage, ObjectSummary, SSE_KMS};
use s3vault_common::{Error, Result};

/// In-memory storage entry.
#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    metadata: ObjectMetadata,
}

/// In-memory object storage.
///
/// Useful for testing and development. Objects are keyed by
/// `(bucket, key)` and kept in key order, like a bucket listing.
/// All data is lost on drop.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<(String, String), Entry>>,
}

impl MemoryStorage {
    /// Create a new empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<(String, String), Entry>>> {
        self.objects
            .read()
            .map_err(|_| Error::Storage("Memory storage lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<(String, String), Entry>>> {
        self.objects
            .write()
            .map_err(|_| Error::Storage("Memory storage lock poisoned".to_string()))
    }

    /// Store an object directly, optionally without encryption.
    ///
    /// Lets tests seed plaintext objects and directory markers that the
    /// encrypted write path never produces.
    pub fn insert(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        kms_key_id: Option<&str>,
    ) -> Result<ObjectMetadata> {
        let metadata = ObjectMetadata {
            kms_key_id: kms_key_id.map(String::from),
            server_side_encryption: kms_key_id.map(|_| SSE_KMS.to_string()),
            content_length: Some(data.len() as u64),
            content_type: Some("binary/octet-stream".to_string()),
            etag: Some(Uuid::new_v4().simple().to_string()),
            last_modified: Some(Utc::now()),
        };

        self.write()?.insert(
            (bucket.to_string(), key.to_string()),
            Entry {
                data,
                metadata: metadata.clone(),
            },
        );

        Ok(metadata)
    }

    /// Number of objects stored in a bucket.
    pub fn len(&self, bucket: &str) -> Result<usize> {
        Ok(self.read()?.keys().filter(|(b, _)| b == bucket).count())
    }

    /// Whether a bucket holds no objects.
    pub fn is_empty(&self, bucket: &str) -> Result<bool> {
        Ok(self.len(bucket)? == 0)
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: i32,
    ) -> Result<Vec<ObjectSummary>> {
        let limit = usize::try_from(max_keys).unwrap_or(0);
        let objects = self.read()?;

        let results = objects
            .iter()
            .filter(|((b, key), _)| b == bucket && key.starts_with(prefix))
            .take(limit)
            .map(|((_, key), entry)| ObjectSummary {
                key: key.clone(),
                size: Some(entry.data.len() as u64),
                last_modified: entry.metadata.last_modified,
                etag: entry.metadata.etag.clone(),
            })
            .collect();

        Ok(results)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        self.read()?
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.metadata.clone())
            .ok_or_else(|| Error::ObjectNotFound(format!("s3://{}/{}", bucket, key)))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.read()?
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.data.clone())
            .ok_or_else(|| Error::ObjectNotFound(format!("s3://{}/{}", bucket, key)))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        kms_key_id: &str,
    ) -> Result<ObjectMetadata> {
        if kms_key_id.is_empty() {
            return Err(Error::Validation(
                "Encrypted write requires a key id".to_string(),
            ));
        }
        self.insert(bucket, key, body, Some(kms_key_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET: &str = "bucket";
    const KEY_ARN: &str = "arn:aws:kms:eu-west-1:123456789012:key/test";

    #[tokio::test]
    async fn test_put_get() {
        let storage = MemoryStorage::new();
        let data = b"Hello, World!".to_vec();

        storage
            .put_object(BUCKET, "a/test", data.clone(), KEY_ARN)
            .await
            .unwrap();
        let downloaded = storage.get_object(BUCKET, "a/test").await.unwrap();

        assert_eq!(downloaded, data);
    }

    #[tokio::test]
    async fn test_head_carries_key() {
        let storage = MemoryStorage::new();
        storage
            .put_object(BUCKET, "a/test", vec![1, 2, 3], KEY_ARN)
            .await
            .unwrap();

        let metadata = storage.head_object(BUCKET, "a/test").await.unwrap();
        assert_eq!(metadata.kms_key_id(), Some(KEY_ARN));
        assert_eq!(metadata.server_side_encryption.as_deref(), Some(SSE_KMS));
        assert_eq!(metadata.content_length, Some(3));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let storage = MemoryStorage::new();
        let err = storage.get_object(BUCKET, "missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = storage.head_object(BUCKET, "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_requires_key() {
        let storage = MemoryStorage::new();
        let result = storage.put_object(BUCKET, "a/test", vec![1], "").await;
        assert!(result.is_err());
        assert!(storage.is_empty(BUCKET).unwrap());
    }

    #[tokio::test]
    async fn test_list_prefix_and_limit() {
        let storage = MemoryStorage::new();
        storage.insert(BUCKET, "a/", vec![], None).unwrap();
        storage.insert(BUCKET, "a/one", vec![1], Some(KEY_ARN)).unwrap();
        storage.insert(BUCKET, "a/two", vec![2], Some(KEY_ARN)).unwrap();
        storage.insert(BUCKET, "b/three", vec![3], Some(KEY_ARN)).unwrap();
        storage.insert("other", "a/four", vec![4], Some(KEY_ARN)).unwrap();

        let listed = storage.list_objects(BUCKET, "a/", 999).await.unwrap();
        let keys: Vec<_> = listed.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["a/", "a/one", "a/two"]);

        let limited = storage.list_objects(BUCKET, "a/", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_insert_unencrypted() {
        let storage = MemoryStorage::new();
        storage.insert(BUCKET, "plain", b"x".to_vec(), None).unwrap();

        let metadata = storage.head_object(BUCKET, "plain").await.unwrap();
        assert!(!metadata.is_encrypted());
        assert_eq!(storage.len(BUCKET).unwrap(), 1);
    }
}
