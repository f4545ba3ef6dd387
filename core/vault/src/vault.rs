//! Vault facade.

use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::store::ObjectStore;
use crate::template::TemplateRenderer;
use s3vault_common::{Error, Result, VaultLocation};
use s3vault_connection::{KeyResolver, KeyService, MetadataProvider};
use s3vault_storage::{ObjectMetadata, ObjectStorage};

/// Content of a freshly created config object.
pub const EMPTY_CONFIG: &[u8] = b"{}";

/// How the encryption key of a write is chosen.
///
/// An explicit ARN is used as-is. Otherwise the key is resolved from the
/// alias, then the role name, then the role of the execution context.
#[derive(Debug, Clone, Default)]
pub struct KeySelection {
    pub key_arn: Option<String>,
    pub key_alias: Option<String>,
    pub role_name: Option<String>,
}

impl KeySelection {
    /// Select an explicit key ARN.
    pub fn arn(key_arn: impl Into<String>) -> Self {
        Self {
            key_arn: Some(key_arn.into()),
            ..Self::default()
        }
    }

    /// Select a key by alias.
    pub fn alias(key_alias: impl Into<String>) -> Self {
        Self {
            key_alias: Some(key_alias.into()),
            ..Self::default()
        }
    }
}

/// Entry point for all vault operations on one bucket and path.
///
/// The facade holds no per-operation state: every call works on a fresh
/// [`ObjectStore`] scoped to the facade's location.
pub struct S3Vault {
    location: VaultLocation,
    storage: Arc<dyn ObjectStorage>,
    key_service: Arc<dyn KeyService>,
    metadata: Option<Arc<dyn MetadataProvider>>,
}

impl S3Vault {
    /// Create a vault facade.
    pub fn new(
        location: VaultLocation,
        storage: Arc<dyn ObjectStorage>,
        key_service: Arc<dyn KeyService>,
    ) -> Self {
        Self {
            location,
            storage,
            key_service,
            metadata: None,
        }
    }

    /// Execution context used as the last key-resolution fallback.
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Scope of this vault.
    pub fn location(&self) -> &VaultLocation {
        &self.location
    }

    fn store(&self) -> ObjectStore {
        ObjectStore::new(self.location.clone(), self.storage.clone())
    }

    /// Key ARN for a write.
    ///
    /// # Errors
    /// - `KeyResolution` if no key can be found
    pub async fn resolve_key(&self, keys: &KeySelection) -> Result<String> {
        if let Some(arn) = keys.key_arn.as_deref().filter(|arn| !arn.is_empty()) {
            debug!("Using explicit key {}", arn);
            return Ok(arn.to_string());
        }

        KeyResolver::new(self.key_service.clone())
            .with_alias(keys.key_alias.as_deref())
            .with_role_name(keys.role_name.as_deref())
            .with_metadata(self.metadata.clone())
            .resolve_key_arn()
            .await
    }

    /// Upload a local file as object `dest`.
    pub async fn put_file(
        &self,
        src: &Path,
        dest: &str,
        keys: &KeySelection,
    ) -> Result<ObjectMetadata> {
        let content = tokio::fs::read(src).await?;
        self.put_bytes(content, dest, keys).await
    }

    /// Store `content` as object `dest`.
    ///
    /// # Postconditions
    /// - Object exists, encrypted with the selected key
    ///
    /// # Errors
    /// - `Validation` for dotted or nested names
    /// - `KeyResolution` if no key can be found
    pub async fn put_bytes(
        &self,
        content: Vec<u8>,
        dest: &str,
        keys: &KeySelection,
    ) -> Result<ObjectMetadata> {
        let key_arn = self.resolve_key(keys).await?;
        let mut store = self.store();
        store
            .put_object(dest, content, &key_arn, false)
            .await?
            .metadata()
            .await
    }

    /// Content of object `name`.
    pub async fn get_file(&self, name: &str) -> Result<Vec<u8>> {
        let mut store = self.store();
        let object = store.get_object(name).await?;
        Ok(object.raw().await?.to_vec())
    }

    /// Header metadata of object `name`.
    pub async fn get_file_metadata(&self, name: &str) -> Result<ObjectMetadata> {
        let mut store = self.store();
        store.get_object(name).await?.metadata().await
    }

    /// Render the template file at `template_path`.
    pub async fn render_template(
        &self,
        template_path: &Path,
        extra: &Map<String, Value>,
    ) -> Result<Vec<u8>> {
        let template = tokio::fs::read_to_string(template_path).await?;
        self.render_template_str(&template, extra).await
    }

    /// Render a template held in memory.
    pub async fn render_template_str(
        &self,
        template: &str,
        extra: &Map<String, Value>,
    ) -> Result<Vec<u8>> {
        let mut store = self.store();
        TemplateRenderer::new()
            .render(template, &mut store, extra)
            .await
    }

    /// Create config object `config` holding an empty mapping.
    ///
    /// Config names may contain dots.
    pub async fn create_config_property(
        &self,
        config: &str,
        keys: &KeySelection,
    ) -> Result<ObjectMetadata> {
        let mut store = self.store();
        self.create_config(&mut store, config, keys).await?;
        store.get_object(config).await?.metadata().await
    }

    async fn create_config(
        &self,
        store: &mut ObjectStore,
        config: &str,
        keys: &KeySelection,
    ) -> Result<()> {
        info!("Creating new config file: {}", config);
        let key_arn = self.resolve_key(keys).await?;
        store
            .put_object(config, EMPTY_CONFIG.to_vec(), &key_arn, true)
            .await?;
        Ok(())
    }

    /// Set property `key` (a dot-path) of config `config` to `value`.
    ///
    /// The config is created first if it does not exist; an existing config
    /// keeps the key it was encrypted with.
    ///
    /// # Errors
    /// - `UnencryptedObject` if the existing config is not encrypted
    pub async fn set_property(
        &self,
        config: &str,
        key: &str,
        value: Value,
        keys: &KeySelection,
    ) -> Result<ObjectMetadata> {
        let mut store = self.store();
        if !store.contains(config).await? {
            self.create_config(&mut store, config, keys).await?;
        }

        store.get_object(config).await?.set(key, value).await?;
        store.update_object(config).await?.metadata().await
    }

    /// Value of property `key` (a dot-path) of config `config`.
    ///
    /// # Errors
    /// - `ObjectNotFound` if the config does not exist
    /// - `PropertyNotFound` if the property does not exist
    pub async fn get_property(&self, config: &str, key: &str) -> Result<Value> {
        let mut store = self.store();
        let object = store.get_object(config).await.inspect_err(|e| {
            if e.is_not_found() {
                error!("No configuration with name: {} found", config);
            }
        })?;
        object.get(key).await
    }

    /// Replace the whole content of config `config` with `document`.
    ///
    /// # Errors
    /// - `Validation` if `document` is not a mapping
    pub async fn put_config(
        &self,
        config: &str,
        document: &Value,
        keys: &KeySelection,
    ) -> Result<ObjectMetadata> {
        if !document.is_object() {
            return Err(Error::Validation(format!(
                "Config {} must be a mapping",
                config
            )));
        }
        let key_arn = self.resolve_key(keys).await?;
        let content = serde_json::to_vec(document)?;
        let mut store = self.store();
        store
            .put_object(config, content, &key_arn, true)
            .await?
            .metadata()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s3vault_connection::{MemoryKeyService, StaticMetadata};
    use s3vault_storage::MemoryStorage;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BUCKET: &str = "bucket";
    const WEB_ARN: &str = "arn:aws:kms:eu-west-1:123456789012:key/web";
    const OPS_ARN: &str = "arn:aws:kms:eu-west-1:123456789012:key/ops";

    fn vault() -> (Arc<MemoryStorage>, S3Vault) {
        let storage = Arc::new(MemoryStorage::new());
        let keys = Arc::new(
            MemoryKeyService::new()
                .with_alias("web", WEB_ARN)
                .with_alias("ops", OPS_ARN),
        );
        let location = VaultLocation::new(BUCKET, "role/web").unwrap();
        (storage.clone(), S3Vault::new(location, storage, keys))
    }

    #[tokio::test]
    async fn test_put_then_get_file() {
        let (_, vault) = vault();
        let mut src = NamedTempFile::new().unwrap();
        src.write_all(b"hello vault\n\x00\x01").unwrap();

        let metadata = vault
            .put_file(src.path(), "greeting", &KeySelection::alias("web"))
            .await
            .unwrap();
        assert_eq!(metadata.kms_key_id(), Some(WEB_ARN));

        let content = vault.get_file("greeting").await.unwrap();
        assert_eq!(content, std::fs::read(src.path()).unwrap());
    }

    #[tokio::test]
    async fn test_explicit_arn_wins_over_alias() {
        let (_, vault) = vault();
        let keys = KeySelection {
            key_arn: Some(OPS_ARN.to_string()),
            key_alias: Some("web".to_string()),
            role_name: None,
        };

        let metadata = vault.put_bytes(b"x".to_vec(), "file", &keys).await.unwrap();
        assert_eq!(metadata.kms_key_id(), Some(OPS_ARN));
    }

    #[tokio::test]
    async fn test_role_name_resolution() {
        let (_, vault) = vault();
        let keys = KeySelection {
            role_name: Some("ops".to_string()),
            ..KeySelection::default()
        };

        let metadata = vault.put_bytes(b"x".to_vec(), "file", &keys).await.unwrap();
        assert_eq!(metadata.kms_key_id(), Some(OPS_ARN));
    }

    #[tokio::test]
    async fn test_context_role_resolution() {
        let (storage, _) = vault();
        let keys = Arc::new(MemoryKeyService::new().with_alias("instance", WEB_ARN));
        let vault = S3Vault::new(VaultLocation::new(BUCKET, "x").unwrap(), storage, keys)
            .with_metadata(Arc::new(StaticMetadata::with_role("instance")));

        let metadata = vault
            .put_bytes(b"x".to_vec(), "file", &KeySelection::default())
            .await
            .unwrap();
        assert_eq!(metadata.kms_key_id(), Some(WEB_ARN));
    }

    #[tokio::test]
    async fn test_unresolvable_key() {
        let (storage, vault) = vault();
        let err = vault
            .put_bytes(b"x".to_vec(), "file", &KeySelection::alias("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyResolution(_)));
        assert!(storage.is_empty(BUCKET).unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_file() {
        let (_, vault) = vault();
        assert!(vault.get_file("missing").await.unwrap_err().is_not_found());
        assert!(vault
            .get_file_metadata("missing")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_file_metadata() {
        let (_, vault) = vault();
        vault
            .put_bytes(b"abc".to_vec(), "file", &KeySelection::alias("web"))
            .await
            .unwrap();

        let metadata = vault.get_file_metadata("file").await.unwrap();
        assert_eq!(metadata.kms_key_id(), Some(WEB_ARN));
        assert_eq!(metadata.content_length, Some(3));
    }

    #[tokio::test]
    async fn test_set_property_creates_config() {
        let (storage, vault) = vault();

        vault
            .set_property("app.json", "db.host", json!("prod-db"), &KeySelection::alias("web"))
            .await
            .unwrap();

        assert_eq!(
            vault.get_property("app.json", "db.host").await.unwrap(),
            json!("prod-db")
        );
        let header = storage
            .head_object(BUCKET, "role/web/app.json")
            .await
            .unwrap();
        assert_eq!(header.kms_key_id(), Some(WEB_ARN));
    }

    #[tokio::test]
    async fn test_set_property_keeps_existing_key_and_siblings() {
        let (storage, vault) = vault();
        vault
            .set_property("app", "name", json!("app"), &KeySelection::alias("web"))
            .await
            .unwrap();

        vault
            .set_property("app", "db.port", json!(5432), &KeySelection::alias("ops"))
            .await
            .unwrap();

        assert_eq!(vault.get_property("app", "name").await.unwrap(), json!("app"));
        assert_eq!(vault.get_property("app", "db.port").await.unwrap(), json!(5432));
        let header = storage.head_object(BUCKET, "role/web/app").await.unwrap();
        assert_eq!(header.kms_key_id(), Some(WEB_ARN));
    }

    #[tokio::test]
    async fn test_set_property_on_unencrypted_config() {
        let (storage, vault) = vault();
        storage
            .insert(BUCKET, "role/web/plain", b"{}".to_vec(), None)
            .unwrap();

        let err = vault
            .set_property("plain", "a", json!(1), &KeySelection::alias("web"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnencryptedObject(_)));
    }

    #[tokio::test]
    async fn test_get_property_errors() {
        let (_, vault) = vault();
        assert!(vault
            .get_property("missing", "a")
            .await
            .unwrap_err()
            .is_not_found());

        vault
            .set_property("conf", "a", json!(1), &KeySelection::alias("web"))
            .await
            .unwrap();
        let err = vault.get_property("conf", "a.b").await.unwrap_err();
        assert!(err.to_string().contains("leaf value"));
        let err = vault.get_property("conf", "b").await.unwrap_err();
        assert!(matches!(err, Error::PropertyNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_config_property() {
        let (storage, vault) = vault();
        let metadata = vault
            .create_config_property("settings.json", &KeySelection::alias("web"))
            .await
            .unwrap();
        assert_eq!(metadata.kms_key_id(), Some(WEB_ARN));
        assert_eq!(
            storage
                .get_object(BUCKET, "role/web/settings.json")
                .await
                .unwrap(),
            EMPTY_CONFIG
        );
    }

    #[tokio::test]
    async fn test_put_config_replaces_document() {
        let (_, vault) = vault();
        vault
            .set_property("conf", "old", json!(1), &KeySelection::alias("web"))
            .await
            .unwrap();

        vault
            .put_config("conf", &json!({"new": 2}), &KeySelection::arn(WEB_ARN))
            .await
            .unwrap();
        assert_eq!(vault.get_property("conf", "new").await.unwrap(), json!(2));
        assert!(vault.get_property("conf", "old").await.is_err());

        let err = vault
            .put_config("conf", &json!([1]), &KeySelection::arn(WEB_ARN))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_render_template_file() {
        let (_, vault) = vault();
        vault
            .set_property("app", "db.host", json!("prod-db"), &KeySelection::alias("web"))
            .await
            .unwrap();
        let mut template = NamedTempFile::new().unwrap();
        template.write_all(b"host={{ app.db.host }}").unwrap();

        let rendered = vault
            .render_template(template.path(), &Map::new())
            .await
            .unwrap();
        assert_eq!(rendered, b"host=prod-db");
    }
}
