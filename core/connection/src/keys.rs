//! Key-management service seam.

use async_trait::async_trait;
use aws_sdk_kms::error::DisplayErrorContext;
use aws_sdk_kms::Client;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tracing::{debug, error};

use s3vault_common::{Error, Result};

/// Key-management service used to turn aliases into key ARNs.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Describe a key by id or alias id (`alias/<name>`).
    ///
    /// # Returns
    /// - `Ok(Some(arn))` if the key exists
    /// - `Ok(None)` if the service reports no such key
    ///
    /// # Errors
    /// - Any other service failure
    async fn describe_key(&self, key_id: &str) -> Result<Option<String>>;
}

/// KMS-backed key service.
#[derive(Clone)]
pub struct AwsKeyService {
    client: Client,
}

impl AwsKeyService {
    /// Wrap an existing KMS client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KeyService for AwsKeyService {
    async fn describe_key(&self, key_id: &str) -> Result<Option<String>> {
        debug!(key_id, "Describing key");

        match self.client.describe_key().key_id(key_id).send().await {
            Ok(resp) => Ok(resp
                .key_metadata()
                .and_then(|metadata| metadata.arn())
                .filter(|arn| !arn.is_empty())
                .map(String::from)),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found_exception() {
                    debug!(key_id, "Key not found");
                    Ok(None)
                } else {
                    error!(
                        key_id,
                        "Error while describing key: {}",
                        DisplayErrorContext(&service_error)
                    );
                    Err(Error::KeyService(format!(
                        "Failed to describe key {}: {}",
                        key_id,
                        DisplayErrorContext(&service_error)
                    )))
                }
            }
        }
    }
}

/// In-memory key service.
///
/// Useful for testing and offline use. Records every key id it is asked
/// about, in order.
#[derive(Default)]
pub struct MemoryKeyService {
    aliases: RwLock<HashMap<String, String>>,
    lookups: Mutex<Vec<String>>,
}

impl MemoryKeyService {
    /// Create a new key service with no keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key under `alias/<alias>`.
    pub fn with_alias(self, alias: &str, arn: &str) -> Self {
        if let Ok(mut aliases) = self.aliases.write() {
            aliases.insert(format!("alias/{}", alias), arn.to_string());
        }
        self
    }

    /// Key ids requested so far.
    pub fn lookups(&self) -> Vec<String> {
        self.lookups
            .lock()
            .map(|lookups| lookups.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KeyService for MemoryKeyService {
    async fn describe_key(&self, key_id: &str) -> Result<Option<String>> {
        self.lookups
            .lock()
            .map_err(|_| Error::KeyService("Key service lock poisoned".to_string()))?
            .push(key_id.to_string());

        let aliases = self
            .aliases
            .read()
            .map_err(|_| Error::KeyService("Key service lock poisoned".to_string()))?;
        Ok(aliases.get(key_id).cloned())
    }
}
