//! Security-token service seam: caller identity and assume-role.

use async_trait::async_trait;
use aws_sdk_sts::error::DisplayErrorContext;
use aws_sdk_sts::Client;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, error};
use zeroize::{Zeroize, ZeroizeOnDrop};

use s3vault_common::{Error, Result};

/// Identity of the principal making calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

/// Temporary credentials issued by assume-role.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AssumedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    #[zeroize(skip)]
    pub expiration: DateTime<Utc>,
}

impl fmt::Debug for AssumedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssumedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &"[REDACTED]")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Parameters of an assume-role call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub external_id: Option<String>,
}

/// Security-token service.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Who am I.
    async fn caller_identity(&self) -> Result<CallerIdentity>;

    /// Exchange the current identity for temporary role credentials.
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<AssumedCredentials>;
}

/// STS-backed identity service.
#[derive(Clone)]
pub struct AwsIdentityService {
    client: Client,
}

impl AwsIdentityService {
    /// Wrap an existing STS client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentityService for AwsIdentityService {
    async fn caller_identity(&self) -> Result<CallerIdentity> {
        let resp = self
            .client
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| {
                Error::KeyService(format!(
                    "Failed to get caller identity: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(CallerIdentity {
            account: resp.account().unwrap_or_default().to_string(),
            arn: resp.arn().unwrap_or_default().to_string(),
            user_id: resp.user_id().unwrap_or_default().to_string(),
        })
    }

    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<AssumedCredentials> {
        debug!(role_arn = %request.role_arn, session = %request.session_name, "Assuming role");

        let mut call = self
            .client
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name);
        if let Some(external_id) = &request.external_id {
            call = call.external_id(external_id);
        }

        let resp = call.send().await.map_err(|e| {
            error!(
                role_arn = %request.role_arn,
                "Error while assuming role: {}",
                DisplayErrorContext(&e)
            );
            Error::TokenFactory(format!(
                "Failed to assume role {}: {}",
                request.role_arn,
                DisplayErrorContext(&e)
            ))
        })?;

        let credentials = resp.credentials().ok_or_else(|| {
            Error::TokenFactory(format!(
                "No credentials returned for role {}",
                request.role_arn
            ))
        })?;

        let expiration = credentials.expiration();
        let expiration = DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
            .ok_or_else(|| Error::TokenFactory("Invalid credential expiration".to_string()))?;

        Ok(AssumedCredentials {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            expiration,
        })
    }
}

/// In-memory identity service for tests and offline use.
pub struct MemoryIdentityService {
    identity: CallerIdentity,
    credentials_ttl: Duration,
    deny_assume_role: bool,
    requests: Mutex<Vec<AssumeRoleRequest>>,
}

impl MemoryIdentityService {
    /// Create an identity in `account` with the given principal ARN.
    pub fn new(account: &str, arn: &str) -> Self {
        Self {
            identity: CallerIdentity {
                account: account.to_string(),
                arn: arn.to_string(),
                user_id: "AIDAMEMORY".to_string(),
            },
            credentials_ttl: Duration::hours(1),
            deny_assume_role: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Make every assume-role call fail.
    pub fn deny_assume_role(mut self) -> Self {
        self.deny_assume_role = true;
        self
    }

    /// Lifetime of issued credentials.
    pub fn with_credentials_ttl(mut self, ttl: Duration) -> Self {
        self.credentials_ttl = ttl;
        self
    }

    /// Assume-role requests received so far.
    pub fn requests(&self) -> Vec<AssumeRoleRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IdentityService for MemoryIdentityService {
    async fn caller_identity(&self) -> Result<CallerIdentity> {
        Ok(self.identity.clone())
    }

    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<AssumedCredentials> {
        self.requests
            .lock()
            .map_err(|_| Error::KeyService("Identity service lock poisoned".to_string()))?
            .push(request.clone());

        if self.deny_assume_role {
            return Err(Error::TokenFactory(format!(
                "Access denied when assuming {}",
                request.role_arn
            )));
        }

        Ok(AssumedCredentials {
            access_key_id: "ASIAMEMORY".to_string(),
            secret_access_key: "memory-secret".to_string(),
            session_token: "memory-session-token".to_string(),
            expiration: Utc::now() + self.credentials_ttl,
        })
    }
}
