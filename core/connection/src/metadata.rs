//! Execution-context metadata.
//!
//! Inside a cloud instance the role, account and region come from the
//! instance metadata endpoint. Outside of one they are derived from the
//! caller identity and the configured region, and the role and instance id
//! are simply unavailable.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error};

use crate::identity::IdentityService;
use s3vault_common::{Error, Result};

/// Default instance metadata endpoint.
pub const INSTANCE_METADATA_ENDPOINT: &str = "http://169.254.169.254/latest";

/// Timeout applied to every metadata request.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECONDS: &str = "21600";

/// Source of role, account, region and instance id.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Name of the role attached to the execution context.
    ///
    /// # Errors
    /// - `RoleUnavailable` if no role is attached
    async fn role(&self) -> Result<String>;

    /// Account id of the execution context.
    async fn account_id(&self) -> Result<String>;

    /// Region of the execution context.
    async fn region(&self) -> Result<String>;

    /// Instance id of the execution context.
    ///
    /// # Errors
    /// - `InstanceIdUnavailable` outside an instance
    async fn instance_id(&self) -> Result<String>;
}

/// Select the metadata provider for the current context.
///
/// The choice is explicit: no probing of the metadata endpoint happens here.
pub fn metadata_provider(
    disable_instance_context: bool,
    identity: Arc<dyn IdentityService>,
    region: Option<String>,
) -> Result<Arc<dyn MetadataProvider>> {
    if disable_instance_context {
        debug!("Using local metadata provider");
        Ok(Arc::new(LocalMetadata::new(identity, region)))
    } else {
        debug!("Using instance metadata provider");
        Ok(Arc::new(InstanceMetadata::new()?))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityDocument {
    account_id: String,
    #[serde(default)]
    availability_zone: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    instance_id: String,
}

impl IdentityDocument {
    fn region(&self) -> Option<String> {
        match &self.region {
            Some(region) if !region.is_empty() => Some(region.clone()),
            _ => {
                let mut zone = self.availability_zone.clone();
                zone.pop();
                Some(zone).filter(|region| !region.is_empty())
            }
        }
    }
}

/// Metadata read from the instance metadata endpoint.
pub struct InstanceMetadata {
    http: Client,
    base_url: String,
    session_token: OnceCell<Option<String>>,
    document: OnceCell<IdentityDocument>,
}

impl InstanceMetadata {
    /// Create a provider for the default endpoint.
    pub fn new() -> Result<Self> {
        Self::with_endpoint(INSTANCE_METADATA_ENDPOINT)
    }

    /// Create a provider for a custom endpoint.
    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| Error::MetadataUnavailable(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            http,
            base_url: endpoint.trim_end_matches('/').to_string(),
            session_token: OnceCell::new(),
            document: OnceCell::new(),
        })
    }

    /// Session token for the token-protected endpoint flavour.
    ///
    /// Endpoints that do not hand out tokens are queried without one.
    async fn session_token(&self) -> Option<String> {
        self.session_token
            .get_or_init(|| async {
                let url = format!("{}/api/token", self.base_url);
                match self
                    .http
                    .put(&url)
                    .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS)
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => resp.text().await.ok(),
                    Ok(resp) => {
                        debug!("Metadata token not issued: {}", resp.status());
                        None
                    }
                    Err(e) => {
                        debug!("Metadata token request failed: {}", e);
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn get_data(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("Fetching instance metadata: {}", url);

        let mut request = self.http.get(&url);
        if let Some(token) = self.session_token().await {
            request = request.header(TOKEN_HEADER, token);
        }

        let resp = request.send().await.map_err(|e| {
            error!("Error while fetching metadata {}: {}", path, e);
            Error::MetadataUnavailable(format!("Unable to reach metadata endpoint: {}", e))
        })?;

        if !resp.status().is_success() {
            return Err(Error::MetadataUnavailable(format!(
                "Metadata request for {} failed with status {}",
                path,
                resp.status()
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| Error::MetadataUnavailable(format!("Invalid metadata body: {}", e)))?;
        Ok(body.trim().to_string())
    }

    async fn document(&self) -> Result<&IdentityDocument> {
        self.document
            .get_or_try_init(|| async {
                let data = self.get_data("dynamic/instance-identity/document").await?;
                serde_json::from_str(&data).map_err(|e| {
                    Error::MetadataUnavailable(format!("Invalid identity document: {}", e))
                })
            })
            .await
    }
}

#[async_trait]
impl MetadataProvider for InstanceMetadata {
    async fn role(&self) -> Result<String> {
        let data = match self.get_data("meta-data/iam/security-credentials/").await {
            Ok(data) => data,
            Err(e) => {
                debug!("No role from metadata: {}", e);
                return Err(Error::RoleUnavailable(
                    "Role not associated with this instance".to_string(),
                ));
            }
        };

        data.lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(String::from)
            .ok_or_else(|| {
                Error::RoleUnavailable("Role not associated with this instance".to_string())
            })
    }

    async fn account_id(&self) -> Result<String> {
        Ok(self.document().await?.account_id.clone())
    }

    async fn region(&self) -> Result<String> {
        self.document().await?.region().ok_or_else(|| {
            Error::MetadataUnavailable("Identity document carries no region".to_string())
        })
    }

    async fn instance_id(&self) -> Result<String> {
        let instance_id = &self.document().await?.instance_id;
        if instance_id.is_empty() {
            return Err(Error::InstanceIdUnavailable(
                "Identity document carries no instance id".to_string(),
            ));
        }
        Ok(instance_id.clone())
    }
}

/// Metadata derived outside an instance.
pub struct LocalMetadata {
    identity: Arc<dyn IdentityService>,
    region: Option<String>,
}

impl LocalMetadata {
    /// Create a provider from an identity service and the configured region.
    pub fn new(identity: Arc<dyn IdentityService>, region: Option<String>) -> Self {
        Self {
            identity,
            region: region.filter(|r| !r.is_empty()),
        }
    }
}

#[async_trait]
impl MetadataProvider for LocalMetadata {
    async fn role(&self) -> Result<String> {
        Err(Error::RoleUnavailable(
            "No role available outside an instance".to_string(),
        ))
    }

    async fn account_id(&self) -> Result<String> {
        let identity = self.identity.caller_identity().await.map_err(|e| {
            error!("Error while retrieving caller identity: {}", e);
            Error::MetadataUnavailable(format!("Unable to determine account id: {}", e))
        })?;
        Ok(identity.account)
    }

    async fn region(&self) -> Result<String> {
        self.region.clone().ok_or_else(|| {
            Error::MetadataUnavailable(
                "No region configured, use --region or a profile with a region".to_string(),
            )
        })
    }

    async fn instance_id(&self) -> Result<String> {
        Err(Error::InstanceIdUnavailable(
            "No instance id available outside an instance".to_string(),
        ))
    }
}

/// Fixed metadata for tests and offline use.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    pub role: Option<String>,
    pub account_id: Option<String>,
    pub region: Option<String>,
    pub instance_id: Option<String>,
}

impl StaticMetadata {
    /// Metadata with an attached role.
    pub fn with_role(role: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl MetadataProvider for StaticMetadata {
    async fn role(&self) -> Result<String> {
        self.role
            .clone()
            .ok_or_else(|| Error::RoleUnavailable("Role not associated".to_string()))
    }

    async fn account_id(&self) -> Result<String> {
        self.account_id
            .clone()
            .ok_or_else(|| Error::MetadataUnavailable("No account id".to_string()))
    }

    async fn region(&self) -> Result<String> {
        self.region
            .clone()
            .ok_or_else(|| Error::MetadataUnavailable("No region".to_string()))
    }

    async fn instance_id(&self) -> Result<String> {
        self.instance_id
            .clone()
            .ok_or_else(|| Error::InstanceIdUnavailable("No instance id".to_string()))
    }
}
