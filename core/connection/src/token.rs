//! Session token cache.
//!
//! A session token is created explicitly by assuming a role and stored in a
//! single owner-only file in the home directory. Reading never refreshes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::{AssumeRoleRequest, AssumedCredentials, IdentityService};
use crate::metadata::MetadataProvider;
use s3vault_common::{Error, Result};

/// Name of the token cache file inside the home directory.
pub const DEFAULT_TOKEN_FILENAME: &str = ".s3vault.token";

/// Temporary credentials persisted between invocations.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "PascalCase")]
pub struct ResolvedToken {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    #[zeroize(skip)]
    #[serde(with = "expiration_format")]
    pub expiration: DateTime<Utc>,
    #[serde(default)]
    pub region: Option<String>,
}

impl ResolvedToken {
    /// Build a token from assumed-role credentials.
    pub fn from_credentials(credentials: &AssumedCredentials, region: Option<String>) -> Self {
        Self {
            access_key_id: credentials.access_key_id.clone(),
            secret_access_key: credentials.secret_access_key.clone(),
            session_token: credentials.session_token.clone(),
            expiration: credentials.expiration,
            region,
        }
    }

    /// Whether the token is still valid at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expiration
    }

    /// Whether the token is still valid.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

impl fmt::Debug for ResolvedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedToken")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &"[REDACTED]")
            .field("expiration", &self.expiration)
            .field("region", &self.region)
            .finish()
    }
}

mod expiration_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid expiration: {}", raw)))
    }

    /// Accepts RFC 3339 and the space-separated `YYYY-MM-DD HH:MM:SS+HH:MM` form.
    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z"))
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Role to assume when creating a session.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub role_name: Option<String>,
    pub role_arn: Option<String>,
    pub external_id: Option<String>,
}

impl SessionRequest {
    /// Role ARN to assume.
    ///
    /// An explicit ARN is used as-is; a role name is expanded with the
    /// account id of the execution context.
    ///
    /// # Errors
    /// - `TokenFactory` if neither a role name nor an ARN is given
    pub async fn role_arn(&self, metadata: &dyn MetadataProvider) -> Result<String> {
        if let Some(arn) = self.role_arn.as_deref().filter(|a| !a.is_empty()) {
            return Ok(arn.to_string());
        }
        let role_name = self
            .role_name
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                Error::TokenFactory(
                    "Session creation requires either a role name or a role arn".to_string(),
                )
            })?;
        let account_id = metadata.account_id().await?;
        Ok(format!("arn:aws:iam::{}:role/{}", account_id, role_name))
    }
}

/// Reads, validates and creates the cached session token.
#[derive(Debug, Clone)]
pub struct TokenFactory {
    path: PathBuf,
}

impl TokenFactory {
    /// Token factory for `~/.s3vault.token`.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            Error::TokenFactory("Unable to locate the home directory".to_string())
        })?;
        Ok(Self::with_path(home.join(DEFAULT_TOKEN_FILENAME)))
    }

    /// Token factory for a custom cache file.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cached token regardless of its validity.
    ///
    /// A missing or unreadable file yields `None`; an unreadable file is
    /// logged.
    pub fn read_token(&self) -> Option<ResolvedToken> {
        if !self.path.exists() {
            return None;
        }
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) => {
                error!("Unable to read token file {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(token) => Some(token),
            Err(e) => {
                error!("Invalid token file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Cached token, only while it is valid.
    pub fn token(&self) -> Option<ResolvedToken> {
        let token = self.read_token()?;
        if !token.is_valid() {
            warn!("Token is expired");
            return None;
        }
        Some(token)
    }

    /// Whether a valid token is cached.
    pub fn has_token(&self) -> bool {
        self.token().is_some()
    }

    /// Persist a token with owner-only permissions.
    pub fn save_token(&self, token: &ResolvedToken) -> Result<()> {
        let data = serde_json::to_vec(token)?;
        write_private(&self.path, &data)?;
        debug!("Token saved to {}", self.path.display());
        Ok(())
    }

    /// Assume a role and cache the resulting session token.
    ///
    /// # Postconditions
    /// - The cache file holds the new token, readable by the owner only
    pub async fn generate_token(
        &self,
        request: &SessionRequest,
        identity: &dyn IdentityService,
        metadata: &dyn MetadataProvider,
        region: Option<String>,
    ) -> Result<ResolvedToken> {
        let role_arn = request.role_arn(metadata).await?;
        let assume = AssumeRoleRequest {
            role_arn,
            session_name: format!("s3vault_{}", Uuid::new_v4().simple()),
            external_id: request.external_id.clone().filter(|e| !e.is_empty()),
        };

        let credentials = identity.assume_role(&assume).await.map_err(|e| match e {
            Error::TokenFactory(_) => e,
            other => Error::TokenFactory(other.to_string()),
        })?;

        let token = ResolvedToken::from_credentials(&credentials, region);
        self.save_token(&token)?;
        info!(
            "Session for {} valid until {}",
            assume.role_arn, token.expiration
        );
        Ok(token)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    // mode() only applies on creation
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityService;
    use crate::metadata::StaticMetadata;
    use chrono::Duration;
    use tempfile::TempDir;

    fn token(expiration: DateTime<Utc>) -> ResolvedToken {
        ResolvedToken {
            access_key_id: "ASIA".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "session".to_string(),
            expiration,
            region: Some("eu-west-1".to_string()),
        }
    }

    #[test]
    fn test_token_validity() {
        let now = Utc::now();
        assert!(!token(now - Duration::seconds(1)).is_valid_at(now));
        assert!(token(now + Duration::seconds(3600)).is_valid_at(now));
    }

    #[test]
    fn test_expiration_formats() {
        let rfc = expiration_format::parse("2030-01-02T03:04:05+00:00").unwrap();
        let spaced = expiration_format::parse("2030-01-02 03:04:05+00:00").unwrap();
        assert_eq!(rfc, spaced);
        assert!(expiration_format::parse("tomorrow").is_none());
    }

    #[test]
    fn test_token_file_field_names() {
        let json = serde_json::to_value(token(Utc::now())).unwrap();
        assert_eq!(json["AccessKeyId"], "ASIA");
        assert_eq!(json["SecretAccessKey"], "secret");
        assert_eq!(json["SessionToken"], "session");
        assert_eq!(json["Region"], "eu-west-1");
        assert!(json["Expiration"].is_string());
    }

    #[test]
    fn test_save_and_read() {
        let temp = TempDir::new().unwrap();
        let factory = TokenFactory::with_path(temp.path().join("token"));
        assert!(!factory.has_token());

        factory
            .save_token(&token(Utc::now() + Duration::hours(1)))
            .unwrap();
        assert!(factory.has_token());
        assert_eq!(factory.token().unwrap().access_key_id, "ASIA");
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_token_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let factory = TokenFactory::with_path(temp.path().join("token"));
        factory
            .save_token(&token(Utc::now() + Duration::hours(1)))
            .unwrap();

        let mode = fs::metadata(factory.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_expired_token_is_not_returned() {
        let temp = TempDir::new().unwrap();
        let factory = TokenFactory::with_path(temp.path().join("token"));
        factory
            .save_token(&token(Utc::now() - Duration::seconds(1)))
            .unwrap();

        assert!(factory.read_token().is_some());
        assert!(factory.token().is_none());
        assert!(!factory.has_token());
    }

    #[test]
    fn test_invalid_token_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("token");
        fs::write(&path, "not json").unwrap();

        let factory = TokenFactory::with_path(path);
        assert!(factory.read_token().is_none());
    }

    #[tokio::test]
    async fn test_generate_token_from_role_name() {
        let temp = TempDir::new().unwrap();
        let factory = TokenFactory::with_path(temp.path().join("token"));
        let identity = MemoryIdentityService::new("123456789012", "arn:aws:iam::123456789012:user/dev");
        let metadata = StaticMetadata {
            account_id: Some("123456789012".to_string()),
            ..StaticMetadata::default()
        };
        let request = SessionRequest {
            role_name: Some("web".to_string()),
            external_id: Some("eid".to_string()),
            ..SessionRequest::default()
        };

        let token = factory
            .generate_token(&request, &identity, &metadata, Some("eu-west-1".to_string()))
            .await
            .unwrap();

        assert_eq!(token.region.as_deref(), Some("eu-west-1"));
        assert!(factory.has_token());

        let sent = identity.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].role_arn, "arn:aws:iam::123456789012:role/web");
        assert_eq!(sent[0].external_id.as_deref(), Some("eid"));
        assert!(sent[0].session_name.starts_with("s3vault_"));
        assert!(!sent[0].session_name.contains('-'));
    }

    #[tokio::test]
    async fn test_generate_token_explicit_arn() {
        let temp = TempDir::new().unwrap();
        let factory = TokenFactory::with_path(temp.path().join("token"));
        let identity = MemoryIdentityService::new("1", "arn");
        let request = SessionRequest {
            role_arn: Some("arn:aws:iam::999:role/ops".to_string()),
            ..SessionRequest::default()
        };

        factory
            .generate_token(&request, &identity, &StaticMetadata::default(), None)
            .await
            .unwrap();
        assert_eq!(identity.requests()[0].role_arn, "arn:aws:iam::999:role/ops");
    }

    #[tokio::test]
    async fn test_generate_token_requires_role() {
        let temp = TempDir::new().unwrap();
        let factory = TokenFactory::with_path(temp.path().join("token"));
        let identity = MemoryIdentityService::new("1", "arn");

        let err = factory
            .generate_token(
                &SessionRequest::default(),
                &identity,
                &StaticMetadata::default(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenFactory(_)));
        assert!(!factory.path().exists());
    }

    #[tokio::test]
    async fn test_generate_token_denied() {
        let temp = TempDir::new().unwrap();
        let factory = TokenFactory::with_path(temp.path().join("token"));
        let identity = MemoryIdentityService::new("1", "arn").deny_assume_role();
        let request = SessionRequest {
            role_arn: Some("arn:role".to_string()),
            ..SessionRequest::default()
        };

        let err = factory
            .generate_token(&request, &identity, &StaticMetadata::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenFactory(_)));
        assert!(!factory.has_token());
    }
}
