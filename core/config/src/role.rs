//! Vault roles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::OnceCell;
use tracing::debug;

use s3vault_common::{Error, Result};
use s3vault_connection::{alias_id, KeyService};

/// Path sentinel meaning "every path of the enclosing config".
pub const PATH_ALL: &str = "_all_";

/// Access a role has on its paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    Read,
    Write,
}

impl Privilege {
    /// Every supported privilege.
    pub const ALL: [Privilege; 2] = [Privilege::Read, Privilege::Write];

    pub fn as_str(&self) -> &'static str {
        match self {
            Privilege::Read => "read",
            Privilege::Write => "write",
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Privilege {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Privilege::Read),
            "write" => Ok(Privilege::Write),
            other => Err(Error::Role(format!("Unknown privilege: {}", other))),
        }
    }
}

/// A role of the vault configuration.
///
/// Immutable once parsed, except for the key ARN which is resolved at most
/// once.
#[derive(Debug)]
pub struct Role {
    name: String,
    paths: Vec<String>,
    privileges: Vec<Privilege>,
    kms_alias: String,
    managed_policies: Vec<String>,
    kms_arn: OnceCell<Option<String>>,
}

fn sanitize_path(path: &str) -> String {
    path.strip_suffix('/').unwrap_or(path).to_string()
}

impl Role {
    /// Create a role with the defaults derived from its name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            paths: vec![name.clone()],
            kms_alias: name.clone(),
            name,
            privileges: Vec::new(),
            managed_policies: Vec::new(),
            kms_arn: OnceCell::new(),
        }
    }

    /// Set the paths, stripping one trailing `/` from each.
    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.paths = paths.iter().map(|path| sanitize_path(path)).collect();
        self
    }

    /// Set the privileges from their names.
    ///
    /// # Errors
    /// - `Role` listing every token outside `read`/`write`
    pub fn with_privileges(mut self, tokens: &[String]) -> Result<Self> {
        let invalid: Vec<&str> = tokens
            .iter()
            .map(String::as_str)
            .filter(|token| token.parse::<Privilege>().is_err())
            .collect();
        if !invalid.is_empty() {
            let allowed: Vec<&str> = Privilege::ALL.iter().map(Privilege::as_str).collect();
            return Err(Error::Role(format!(
                "Privileges: [{}] contains not supported keywords: [{}]. Allowed: [{}]",
                tokens.join(", "),
                invalid.join(", "),
                allowed.join(", ")
            )));
        }

        let mut privileges = Vec::new();
        for token in tokens {
            let privilege = token.parse::<Privilege>()?;
            if !privileges.contains(&privilege) {
                privileges.push(privilege);
            }
        }
        self.privileges = privileges;
        Ok(self)
    }

    pub fn with_kms_alias(mut self, kms_alias: impl Into<String>) -> Self {
        self.kms_alias = kms_alias.into();
        self
    }

    pub fn with_managed_policies(mut self, managed_policies: Vec<String>) -> Self {
        self.managed_policies = managed_policies;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Paths as declared. See `VaultConfig::paths_for` for the resolved list.
    pub fn declared_paths(&self) -> &[String] {
        &self.paths
    }

    /// Whether the role covers every path of the config.
    pub fn is_path_all(&self) -> bool {
        self.paths.len() == 1 && self.paths[0] == PATH_ALL
    }

    pub fn privileges(&self) -> &[Privilege] {
        &self.privileges
    }

    pub fn can_read(&self) -> bool {
        self.privileges.contains(&Privilege::Read)
    }

    pub fn can_write(&self) -> bool {
        self.privileges.contains(&Privilege::Write)
    }

    pub fn kms_alias(&self) -> &str {
        &self.kms_alias
    }

    pub fn managed_policies(&self) -> &[String] {
        &self.managed_policies
    }

    /// ARN of the key behind the role's alias, if the key exists.
    ///
    /// The lookup happens once; later calls return the cached answer.
    pub async fn kms_arn(&self, key_service: &dyn KeyService) -> Result<Option<&str>> {
        let arn = self
            .kms_arn
            .get_or_try_init(|| async {
                let arn = key_service.describe_key(&alias_id(&self.kms_alias)).await?;
                debug!(role = %self.name, "Key for alias {}: {:?}", self.kms_alias, arn);
                Ok::<_, Error>(arn)
            })
            .await?;
        Ok(arn.as_deref())
    }

    /// Key ARN, if it has already been resolved.
    pub fn cached_kms_arn(&self) -> Option<&str> {
        self.kms_arn.get().and_then(|arn| arn.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s3vault_connection::MemoryKeyService;

    fn tokens(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_defaults_from_name() {
        let role = Role::new("web");
        assert_eq!(role.declared_paths(), ["web"]);
        assert_eq!(role.kms_alias(), "web");
        assert!(role.managed_policies().is_empty());
    }

    #[test]
    fn test_paths_sanitized() {
        let role = Role::new("web").with_paths(tokens(&["a/", "b", "c/d/"]));
        assert_eq!(role.declared_paths(), ["a", "b", "c/d"]);
    }

    #[test]
    fn test_path_all() {
        assert!(Role::new("ops").with_paths(tokens(&["_all_"])).is_path_all());
        assert!(!Role::new("ops")
            .with_paths(tokens(&["_all_", "x"]))
            .is_path_all());
    }

    #[test]
    fn test_privileges() {
        let role = Role::new("web")
            .with_privileges(&tokens(&["read", "write", "read"]))
            .unwrap();
        assert_eq!(role.privileges(), [Privilege::Read, Privilege::Write]);
        assert!(role.can_read());
        assert!(role.can_write());
    }

    #[test]
    fn test_invalid_privileges_named() {
        let err = Role::new("web")
            .with_privileges(&tokens(&["read", "admin", "root"]))
            .unwrap_err();
        assert!(matches!(err, Error::Role(_)));
        let message = err.to_string();
        assert!(message.contains("admin"));
        assert!(message.contains("root"));
        assert_eq!(err.kind(), "RoleException");
    }

    #[tokio::test]
    async fn test_kms_arn_resolved_once() {
        let keys = MemoryKeyService::new().with_alias("web", "arn:web");
        let role = Role::new("web");
        assert_eq!(role.cached_kms_arn(), None);

        assert_eq!(role.kms_arn(&keys).await.unwrap(), Some("arn:web"));
        assert_eq!(role.kms_arn(&keys).await.unwrap(), Some("arn:web"));
        assert_eq!(role.cached_kms_arn(), Some("arn:web"));
        assert_eq!(keys.lookups(), vec!["alias/web"]);
    }

    #[tokio::test]
    async fn test_kms_arn_missing_key() {
        let keys = MemoryKeyService::new();
        let role = Role::new("web").with_kms_alias("alias/custom");

        assert_eq!(role.kms_arn(&keys).await.unwrap(), None);
        assert_eq!(keys.lookups(), vec!["alias/custom"]);
    }
}
