//! Encryption key resolution.

use std::sync::Arc;
use tracing::{debug, info};

use crate::keys::KeyService;
use crate::metadata::MetadataProvider;
use s3vault_common::{Error, Result};

/// Resolves the ARN of the key used to encrypt vault objects.
///
/// Candidates are tried in order, stopping at the first that names an
/// existing key:
/// 1. the configured alias
/// 2. an alias named after the configured role
/// 3. an alias named after the role of the execution context
pub struct KeyResolver {
    key_service: Arc<dyn KeyService>,
    metadata: Option<Arc<dyn MetadataProvider>>,
    key_alias: Option<String>,
    role_name: Option<String>,
}

/// Normalize an alias to its `alias/<name>` id form.
///
/// Everything up to the last `alias/` is dropped, so bare names, alias ids
/// and alias ARNs all normalize to the same id.
pub fn alias_id(alias: &str) -> String {
    let name = alias
        .rsplit_once("alias/")
        .map(|(_, name)| name)
        .unwrap_or(alias);
    format!("alias/{}", name)
}

impl KeyResolver {
    /// Create a resolver with no candidates configured.
    pub fn new(key_service: Arc<dyn KeyService>) -> Self {
        Self {
            key_service,
            metadata: None,
            key_alias: None,
            role_name: None,
        }
    }

    /// Set the alias tried first. Empty values are ignored.
    pub fn with_alias(mut self, alias: Option<&str>) -> Self {
        self.key_alias = alias.filter(|a| !a.is_empty()).map(String::from);
        self
    }

    /// Set the role whose alias is tried second. Empty values are ignored.
    pub fn with_role_name(mut self, role_name: Option<&str>) -> Self {
        self.role_name = role_name.filter(|r| !r.is_empty()).map(String::from);
        self
    }

    /// Set the execution context consulted last.
    pub fn with_metadata(mut self, metadata: Option<Arc<dyn MetadataProvider>>) -> Self {
        self.metadata = metadata;
        self
    }

    async fn key_from_alias(&self, alias: &str) -> Result<Option<String>> {
        let key_id = alias_id(alias);
        let arn = self.key_service.describe_key(&key_id).await?;
        match &arn {
            Some(arn) => debug!("Alias {} resolved to {}", key_id, arn),
            None => debug!("Alias {} not found", key_id),
        }
        Ok(arn)
    }

    /// Resolve the key ARN.
    ///
    /// # Errors
    /// - `KeyResolution` if no candidate names an existing key
    /// - Key service and metadata errors are returned unchanged
    pub async fn resolve_key_arn(&self) -> Result<String> {
        if let Some(alias) = &self.key_alias {
            if let Some(arn) = self.key_from_alias(alias).await? {
                return Ok(arn);
            }
        }

        if let Some(role_name) = &self.role_name {
            if let Some(arn) = self.key_from_alias(role_name).await? {
                return Ok(arn);
            }
        }

        let Some(metadata) = &self.metadata else {
            return Err(Error::KeyResolution(
                "Unable to resolve key: no alias or role matched and no execution context is available"
                    .to_string(),
            ));
        };

        let role = metadata.role().await?;
        info!("Resolving key from execution context role {}", role);
        self.key_from_alias(&role).await?.ok_or_else(|| {
            Error::KeyResolution(format!("Unable to resolve key for role {}", role))
        })
    }
}
