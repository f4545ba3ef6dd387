//! Service client construction.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_sts::config::Credentials;
use aws_sdk_sts::error::DisplayErrorContext;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::identity::{AwsIdentityService, IdentityService};
use crate::keys::{AwsKeyService, KeyService};
use crate::metadata::{metadata_provider, InstanceMetadata, MetadataProvider};
use crate::token::ResolvedToken;
use s3vault_common::{Error, Result};
use s3vault_storage::{ObjectStorage, S3Storage};

const TOKEN_PROVIDER_NAME: &str = "s3vault-session-token";

/// Kinds of service client the factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    S3,
    Kms,
    Sts,
}

impl FromStr for ServiceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "s3" => Ok(ServiceKind::S3),
            "kms" => Ok(ServiceKind::Kms),
            "sts" => Ok(ServiceKind::Sts),
            _ => Err(Error::Connection(format!("connection: {} not supported", s))),
        }
    }
}

/// A constructed service client.
#[derive(Debug, Clone)]
pub enum ServiceClient {
    S3(aws_sdk_s3::Client),
    Kms(aws_sdk_kms::Client),
    Sts(aws_sdk_sts::Client),
}

/// Builds service clients from region, profile and session token.
///
/// A session token, when given, replaces ambient credentials and profile.
/// A missing region is taken from the token, then from the SDK's own
/// configuration chain, and finally from the execution context.
#[derive(Default)]
pub struct ConnectionFactory {
    region: Option<String>,
    profile: Option<String>,
    endpoint: Option<String>,
    token: Option<ResolvedToken>,
    disable_instance_context: bool,
    sdk_config: OnceCell<SdkConfig>,
}

impl ConnectionFactory {
    /// Create a factory.
    ///
    /// `disable_instance_context` selects the local metadata provider.
    pub fn new(disable_instance_context: bool) -> Self {
        Self {
            disable_instance_context,
            ..Self::default()
        }
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region.filter(|r| !r.is_empty());
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile.filter(|p| !p.is_empty());
        self
    }

    /// Custom storage endpoint, for S3-compatible services.
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint.filter(|e| !e.is_empty());
        self
    }

    pub fn with_token(mut self, token: Option<ResolvedToken>) -> Self {
        self.token = token;
        self
    }

    /// Whether the instance metadata endpoint is consulted.
    pub fn is_instance_context(&self) -> bool {
        !self.disable_instance_context
    }

    async fn load_sdk_config(&self) -> Result<SdkConfig> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        let mut region = self.region.clone();
        if let Some(token) = &self.token {
            debug!("Connection will use the cached session token");
            let expiry: SystemTime = token.expiration.into();
            loader = loader.credentials_provider(Credentials::new(
                token.access_key_id.clone(),
                token.secret_access_key.clone(),
                Some(token.session_token.clone()),
                Some(expiry),
                TOKEN_PROVIDER_NAME,
            ));
            if region.is_none() {
                region = token.region.clone();
            }
        } else if let Some(profile) = &self.profile {
            debug!("Connection will use profile {}", profile);
            loader = loader.profile_name(profile);
        }

        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }

        let config = loader.load().await;
        if config.region().is_some() {
            return Ok(config);
        }

        if self.disable_instance_context {
            return Err(Error::MetadataUnavailable(
                "No region configured, use --region or a profile with a region".to_string(),
            ));
        }

        let region = InstanceMetadata::new()?.region().await?;
        debug!("Region from instance metadata: {}", region);
        Ok(config.to_builder().region(Region::new(region)).build())
    }

    /// Shared SDK configuration, loaded on first use.
    pub async fn sdk_config(&self) -> Result<&SdkConfig> {
        self.sdk_config
            .get_or_try_init(|| self.load_sdk_config())
            .await
    }

    /// Region the clients are bound to.
    pub async fn region(&self) -> Result<Option<String>> {
        Ok(self
            .sdk_config()
            .await?
            .region()
            .map(|region| region.to_string()))
    }

    async fn log_identity(&self, config: &SdkConfig) {
        let client = aws_sdk_sts::Client::new(config);
        let arn = match client.get_caller_identity().send().await {
            Ok(resp) => resp.arn().unwrap_or("n/a").to_string(),
            Err(e) => {
                error!(
                    "Error while retrieving identity arn: {}",
                    DisplayErrorContext(&e)
                );
                "n/a".to_string()
            }
        };
        info!("Using identity arn: {}", arn);
    }

    async fn prepare(&self) -> Result<&SdkConfig> {
        let config = self.sdk_config().await?;
        self.log_identity(config).await;
        Ok(config)
    }

    /// Build a client of the given kind.
    pub async fn client(&self, kind: ServiceKind) -> Result<ServiceClient> {
        let config = self.prepare().await?;
        Ok(match kind {
            ServiceKind::S3 => ServiceClient::S3(self.s3_client(config)),
            ServiceKind::Kms => ServiceClient::Kms(aws_sdk_kms::Client::new(config)),
            ServiceKind::Sts => ServiceClient::Sts(aws_sdk_sts::Client::new(config)),
        })
    }

    /// Build a client by service name (`s3`, `kms`, `sts`).
    ///
    /// # Errors
    /// - `Connection` for any other name
    pub async fn client_named(&self, name: &str) -> Result<ServiceClient> {
        self.client(name.parse()?).await
    }

    fn s3_client(&self, config: &SdkConfig) -> aws_sdk_s3::Client {
        S3Storage::from_sdk_config(config, self.endpoint.as_deref())
            .client()
            .clone()
    }

    /// Object storage backed by S3.
    pub async fn object_storage(&self) -> Result<Arc<dyn ObjectStorage>> {
        let config = self.prepare().await?;
        Ok(Arc::new(S3Storage::from_sdk_config(
            config,
            self.endpoint.as_deref(),
        )))
    }

    /// Key service backed by KMS.
    pub async fn key_service(&self) -> Result<Arc<dyn KeyService>> {
        let config = self.prepare().await?;
        Ok(Arc::new(AwsKeyService::new(aws_sdk_kms::Client::new(config))))
    }

    /// Identity service backed by STS.
    pub async fn identity_service(&self) -> Result<Arc<dyn IdentityService>> {
        let config = self.prepare().await?;
        Ok(Arc::new(AwsIdentityService::new(aws_sdk_sts::Client::new(
            config,
        ))))
    }

    /// Metadata provider matching the factory's context flag.
    pub async fn metadata(&self) -> Result<Arc<dyn MetadataProvider>> {
        if self.disable_instance_context {
            let identity = self.identity_service().await?;
            metadata_provider(true, identity, self.region().await?)
        } else {
            Ok(Arc::new(InstanceMetadata::new()?))
        }
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("region", &self.region)
            .field("profile", &self.profile)
            .field("endpoint", &self.endpoint)
            .field("has_token", &self.token.is_some())
            .field("disable_instance_context", &self.disable_instance_context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_parsing() {
        assert_eq!("s3".parse::<ServiceKind>().unwrap(), ServiceKind::S3);
        assert_eq!("KMS".parse::<ServiceKind>().unwrap(), ServiceKind::Kms);
        assert_eq!("sts".parse::<ServiceKind>().unwrap(), ServiceKind::Sts);
    }

    #[test]
    fn test_unsupported_service() {
        let err = "dynamodb".parse::<ServiceKind>().unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(err.to_string().contains("dynamodb"));
    }

    #[tokio::test]
    async fn test_unsupported_client_name() {
        let factory = ConnectionFactory::new(true);
        let err = factory.client_named("ec2").await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn test_factory_options() {
        let factory = ConnectionFactory::new(true)
            .with_region(Some(String::new()))
            .with_profile(Some("dev".to_string()));
        assert!(!factory.is_instance_context());
        assert!(factory.region.is_none());
        assert_eq!(factory.profile.as_deref(), Some("dev"));
    }

    #[tokio::test]
    async fn test_identity_lookup_failure_is_not_fatal() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                "<ErrorResponse><Error><Type>Sender</Type><Code>AccessDenied</Code>\
                 <Message>not authorized</Message></Error></ErrorResponse>",
            ))
            .expect(1..)
            .mount(&server)
            .await;

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new("eu-west-1"))
            .credentials_provider(Credentials::new("AKID", "SECRET", None, None, "test"))
            .endpoint_url(server.uri())
            .load()
            .await;

        let factory = ConnectionFactory::new(true);
        factory.log_identity(&config).await;
    }

    #[test]
    fn test_debug_hides_token() {
        let factory = ConnectionFactory::new(false);
        let output = format!("{:?}", factory);
        assert!(output.contains("has_token: false"));
    }
}
