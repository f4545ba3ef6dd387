//! Encrypted object handle with dot-path field access.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

use s3vault_common::{Error, Result};
use s3vault_storage::{ObjectMetadata, ObjectStorage, ObjectSummary};

/// Separator of dot-path segments.
pub const PATH_SEPARATOR: char = '.';

/// Handle to one object of a vault scope.
///
/// Content and header are fetched together on first access and reused
/// until [`EncryptedObject::refresh`] is called. Mutations through
/// [`EncryptedObject::set`] only change the in-memory copy; persisting is
/// the owning store's job.
#[derive(Clone)]
pub struct EncryptedObject {
    name: String,
    bucket: String,
    key: String,
    summary: ObjectSummary,
    storage: Arc<dyn ObjectStorage>,
    header: Option<ObjectMetadata>,
    raw: Option<Vec<u8>>,
}

impl EncryptedObject {
    /// Create an unloaded handle from a listing entry.
    pub(crate) fn new(bucket: &str, summary: ObjectSummary, storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            name: summary.name().to_string(),
            bucket: bucket.to_string(),
            key: summary.key.clone(),
            summary,
            storage,
            header: None,
            raw: None,
        }
    }

    /// Object name (final path segment).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full storage key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Listing entry the handle was created from.
    pub fn summary(&self) -> &ObjectSummary {
        &self.summary
    }

    /// Whether content and header have been fetched.
    pub fn is_loaded(&self) -> bool {
        self.raw.is_some()
    }

    /// Fetch header then content.
    ///
    /// The two fetches are separate calls; a header failure is returned
    /// as-is and the content is not requested.
    async fn load(&mut self) -> Result<()> {
        let header = self
            .storage
            .head_object(&self.bucket, &self.key)
            .await
            .inspect_err(|e| {
                error!(
                    "Exception while fetching header for key: {}. Error: {}",
                    self.key, e
                )
            })?;

        let raw = self.storage.get_object(&self.bucket, &self.key).await?;
        debug!("Loaded {} ({} bytes)", self.key, raw.len());

        self.header = Some(header);
        self.raw = Some(raw);
        Ok(())
    }

    async fn ensure_loaded(&mut self) -> Result<()> {
        if !self.is_loaded() {
            self.load().await?;
        }
        Ok(())
    }

    /// Drop cached content and fetch it again.
    pub async fn refresh(&mut self) -> Result<()> {
        self.header = None;
        self.raw = None;
        self.load().await
    }

    /// Header metadata of the stored object.
    pub async fn metadata(&mut self) -> Result<ObjectMetadata> {
        self.ensure_loaded().await?;
        Ok(self.header.clone().unwrap_or_default())
    }

    /// Raw content of the object.
    pub async fn raw(&mut self) -> Result<&[u8]> {
        self.ensure_loaded().await?;
        Ok(self.raw.as_deref().unwrap_or_default())
    }

    /// Key that encrypted the object, once loaded.
    pub fn kms_arn(&self) -> Option<&str> {
        self.header.as_ref().and_then(|header| header.kms_key_id())
    }

    /// Whether the loaded header carries a key.
    pub fn is_encrypted(&self) -> bool {
        self.kms_arn().is_some()
    }

    fn parsed(&self) -> Result<Value> {
        let raw = self.raw.as_deref().unwrap_or_default();
        serde_json::from_slice(raw).map_err(|_| {
            Error::PropertyNotFound(format!("{} is not a valid JSON document", self.name))
        })
    }

    /// Read the value at a dot-separated path.
    ///
    /// # Errors
    /// - `Validation` if the path has empty segments
    /// - `PropertyNotFound` if the content is not JSON, an intermediate
    ///   segment is a leaf value, or the path does not exist
    pub async fn get(&mut self, path: &str) -> Result<Value> {
        let segments = split_path(path)?;
        self.ensure_loaded().await?;
        let document = self.parsed()?;
        get_value(&document, &segments).cloned()
    }

    /// Write `value` at a dot-separated path.
    ///
    /// Missing intermediate mappings are created, siblings of the path are
    /// left untouched and the value at the path is replaced as a whole.
    ///
    /// # Errors
    /// - `Validation` if the path has empty segments or the document root
    ///   is not a mapping
    /// - `PropertyNotFound` if the content is not JSON
    pub async fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let segments = split_path(path)?;
        self.ensure_loaded().await?;
        let mut document = self.parsed()?;
        set_value(&mut document, &segments, value)?;
        self.raw = Some(serde_json::to_vec(&document)?);
        Ok(())
    }
}

impl fmt::Debug for EncryptedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedObject")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

/// Split a dot-path into its segments.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(Error::Validation(format!("Invalid property path: '{}'", path)));
    }
    Ok(segments)
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Walk `document` along `segments`.
pub fn get_value<'a>(document: &'a Value, segments: &[&str]) -> Result<&'a Value> {
    let mut current = document;
    for segment in segments {
        let map = current.as_object().ok_or_else(|| {
            Error::PropertyNotFound(format!(
                "{} is a leaf value, not a mapping",
                describe(current)
            ))
        })?;
        current = map
            .get(*segment)
            .ok_or_else(|| Error::PropertyNotFound((*segment).to_string()))?;
    }
    Ok(current)
}

/// Place `value` at `segments` inside `document`.
pub fn set_value(document: &mut Value, segments: &[&str], value: Value) -> Result<()> {
    let Some((leaf, parents)) = segments.split_last() else {
        return Err(Error::Validation("Empty property path".to_string()));
    };
    let mut current = match document {
        Value::Object(map) => map,
        _ => {
            return Err(Error::Validation(
                "Document root is not a mapping".to_string(),
            ))
        }
    };

    for segment in parents {
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => return Err(Error::Validation(format!("Unable to descend into {}", segment))),
        };
    }

    current.insert((*leaf).to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use s3vault_storage::MemoryStorage;
    use serde_json::json;

    const BUCKET: &str = "bucket";
    const KEY_ARN: &str = "arn:aws:kms:eu-west-1:123456789012:key/test";

    fn handle(storage: &Arc<MemoryStorage>, key: &str) -> EncryptedObject {
        EncryptedObject::new(BUCKET, ObjectSummary::new(key), storage.clone())
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("a.b.c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(split_path("a").unwrap(), vec!["a"]);
        assert!(split_path("").is_err());
        assert!(split_path("a..b").is_err());
        assert!(split_path(".a").is_err());
    }

    #[test]
    fn test_get_nested() {
        let document = json!({"db": {"host": "prod-db", "port": 5432}});
        assert_eq!(get_value(&document, &["db", "host"]).unwrap(), "prod-db");
        assert_eq!(get_value(&document, &["db", "port"]).unwrap(), 5432);
    }

    #[test]
    fn test_get_through_leaf() {
        let document = json!({"a": 1});
        let err = get_value(&document, &["a", "b"]).unwrap_err();
        assert!(matches!(err, Error::PropertyNotFound(_)));
        assert!(err.to_string().contains("leaf value"));
    }

    #[test]
    fn test_get_missing() {
        let document = json!({"a": {}});
        let err = get_value(&document, &["a", "b"]).unwrap_err();
        assert!(matches!(err, Error::PropertyNotFound(_)));
    }

    #[test]
    fn test_set_creates_intermediate_mappings() {
        let mut document = json!({});
        set_value(&mut document, &["db", "host"], json!("prod-db")).unwrap();
        assert_eq!(document, json!({"db": {"host": "prod-db"}}));
    }

    #[test]
    fn test_set_keeps_siblings() {
        let mut document = json!({"db": {"host": "a", "port": 1}, "name": "app"});
        set_value(&mut document, &["db", "host"], json!("b")).unwrap();
        assert_eq!(
            document,
            json!({"db": {"host": "b", "port": 1}, "name": "app"})
        );
    }

    #[test]
    fn test_set_replaces_leaf_on_path() {
        let mut document = json!({"db": "plain"});
        set_value(&mut document, &["db", "host"], json!("x")).unwrap();
        assert_eq!(document, json!({"db": {"host": "x"}}));
    }

    #[test]
    fn test_set_replaces_mapping_value() {
        let mut document = json!({"db": {"host": "a", "port": 1}});
        set_value(&mut document, &["db"], json!({"user": "u"})).unwrap();
        assert_eq!(document, json!({"db": {"user": "u"}}));
    }

    #[test]
    fn test_set_rejects_non_mapping_root() {
        let mut document = json!([1, 2]);
        assert!(set_value(&mut document, &["a"], json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_lazy_load() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert(BUCKET, "a/conf", br#"{"a": {"b": 1}}"#.to_vec(), Some(KEY_ARN))
            .unwrap();

        let mut object = handle(&storage, "a/conf");
        assert_eq!(object.name(), "conf");
        assert!(!object.is_loaded());
        assert_eq!(object.kms_arn(), None);

        assert_eq!(object.get("a.b").await.unwrap(), json!(1));
        assert!(object.is_loaded());
        assert_eq!(object.kms_arn(), Some(KEY_ARN));
        assert!(object.is_encrypted());
    }

    #[tokio::test]
    async fn test_cached_until_refresh() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert(BUCKET, "conf", br#"{"v": 1}"#.to_vec(), Some(KEY_ARN))
            .unwrap();

        let mut object = handle(&storage, "conf");
        assert_eq!(object.get("v").await.unwrap(), json!(1));

        storage
            .insert(BUCKET, "conf", br#"{"v": 2}"#.to_vec(), Some(KEY_ARN))
            .unwrap();
        assert_eq!(object.get("v").await.unwrap(), json!(1));

        object.refresh().await.unwrap();
        assert_eq!(object.get("v").await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_header_failure_propagates() {
        let storage = Arc::new(MemoryStorage::new());
        let mut object = handle(&storage, "missing");

        let err = object.get("a").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!object.is_loaded());
    }

    #[tokio::test]
    async fn test_non_json_content() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert(BUCKET, "plain", b"hello".to_vec(), Some(KEY_ARN))
            .unwrap();

        let mut object = handle(&storage, "plain");
        let err = object.get("a").await.unwrap_err();
        assert!(matches!(err, Error::PropertyNotFound(_)));
        assert_eq!(object.raw().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_set_is_in_memory() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert(BUCKET, "conf", br#"{"keep": true}"#.to_vec(), Some(KEY_ARN))
            .unwrap();

        let mut object = handle(&storage, "conf");
        object.set("db.host", json!("prod-db")).await.unwrap();

        assert_eq!(object.get("db.host").await.unwrap(), json!("prod-db"));
        assert_eq!(object.get("keep").await.unwrap(), json!(true));
        assert_eq!(
            storage.get_object(BUCKET, "conf").await.unwrap(),
            br#"{"keep": true}"#.to_vec()
        );
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
        ]
    }

    proptest! {
        #[test]
        fn prop_set_then_get(
            path in prop::collection::vec(segment(), 1..4),
            value in scalar(),
            sibling in scalar(),
        ) {
            let mut document = json!({"__sibling": sibling.clone()});
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();

            set_value(&mut document, &segments, value.clone()).unwrap();

            prop_assert_eq!(get_value(&document, &segments).unwrap(), &value);
            prop_assert_eq!(&document["__sibling"], &sibling);
        }
    }
}
