//! Declarative vault configuration.
//!
//! ```yaml
//! vaultlib:
//!   vault:
//!     bucket: my-vault-bucket
//!   roles:
//!     - name: web
//!       path: [web, shared/]
//!       privileges: [read]
//! ```

use serde_yaml_ng::{Mapping, Value};
use std::path::Path;
use tracing::{debug, error, info};

use crate::role::Role;
use s3vault_common::{Error, Result};

/// Name of the top-level configuration section.
pub const CONFIG_SECTION: &str = "vaultlib";

/// Section name accepted for configurations written for older releases.
pub const LEGACY_CONFIG_SECTION: &str = "s3vaultlib";

/// Example configuration written by `s3v init`.
pub const EXAMPLE_CONFIG: &str = include_str!("../resources/s3vault.example.yml");

/// Parsed vault configuration.
#[derive(Debug)]
pub struct VaultConfig {
    bucket: String,
    roles: Vec<Role>,
    path_all: Vec<String>,
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Sequence(seq) => seq.is_empty(),
        Value::Mapping(map) => map.is_empty(),
        _ => false,
    }
}

fn get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|value| !is_empty(value))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A scalar or a sequence of scalars, as a list.
fn string_list(value: &Value, field: &str, role: &str) -> Result<Vec<String>> {
    match value {
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                scalar(item).ok_or_else(|| {
                    Error::Config(format!(
                        "Invalid {} entry for role {}: {:?}",
                        field, role, item
                    ))
                })
            })
            .collect(),
        other => scalar(other).map(|s| vec![s]).ok_or_else(|| {
            Error::Config(format!("Invalid {} for role {}: {:?}", field, role, other))
        }),
    }
}

impl VaultConfig {
    /// Load a configuration file.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Config` if a required section or field is missing
    /// - `Role` if a role declares unsupported privileges
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading vault configuration from {}", path.display());
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    /// Parse a configuration document.
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        let document: Value = serde_yaml_ng::from_str(data).map_err(|e| {
            error!("Unable to load config file. Error is: {}", e);
            Error::Config(format!("Unable to parse config file: {}", e))
        })?;

        let section = document
            .as_mapping()
            .and_then(|root| {
                get(root, CONFIG_SECTION).or_else(|| get(root, LEGACY_CONFIG_SECTION))
            })
            .and_then(Value::as_mapping)
            .ok_or_else(|| {
                Error::Config(format!("No {} config section in the file", CONFIG_SECTION))
            })?;

        let bucket = Self::parse_vault(section)?;
        let mut config = Self {
            bucket,
            roles: Vec::new(),
            path_all: Vec::new(),
        };
        config.parse_roles(section)?;
        Ok(config)
    }

    fn parse_vault(section: &Mapping) -> Result<String> {
        let vault = get(section, "vault")
            .and_then(Value::as_mapping)
            .ok_or_else(|| Error::Config(
                "Vault section empty, no bucket configured for vault".to_string(),
            ))?;
        get(vault, "bucket")
            .and_then(scalar)
            .ok_or_else(|| Error::Config("No bucket configured for vault".to_string()))
    }

    fn parse_roles(&mut self, section: &Mapping) -> Result<()> {
        let roles = get(section, "roles")
            .and_then(Value::as_sequence)
            .ok_or_else(|| Error::Config("No roles configured".to_string()))?;

        for entry in roles {
            let role = self.parse_role(entry)?;
            if !role.is_path_all() {
                self.path_all.extend(role.declared_paths().iter().cloned());
            }
            debug!("Parsed role {}", role.name());
            self.roles.push(role);
        }
        Ok(())
    }

    fn parse_role(&self, entry: &Value) -> Result<Role> {
        let fields = entry.as_mapping().ok_or_else(|| {
            Error::Config(format!("No role name provided for config: {:?}", entry))
        })?;
        let name = get(fields, "name").and_then(scalar).ok_or_else(|| {
            Error::Config(format!("No role name provided for config: {:?}", entry))
        })?;

        let mut role = Role::new(name.clone());
        if let Some(path) = get(fields, "path") {
            role = role.with_paths(string_list(path, "path", &name)?);
        }

        let privileges = get(fields, "privileges")
            .ok_or_else(|| Error::Config(format!("Privileges not set for role: {}", name)))?;
        role = role.with_privileges(&string_list(privileges, "privileges", &name)?)?;

        if let Some(alias) = get(fields, "kms_alias").and_then(scalar) {
            role = role.with_kms_alias(alias);
        }
        if let Some(policies) = get(fields, "managed_policies") {
            role = role.with_managed_policies(string_list(policies, "managed_policies", &name)?);
        }
        Ok(role)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Role by name.
    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|role| role.name() == name)
    }

    /// Paths of every role not covering all paths, in declaration order.
    pub fn path_all(&self) -> &[String] {
        &self.path_all
    }

    /// Resolved paths of `role`: its own, or all paths for `_all_`.
    pub fn paths_for<'a>(&'a self, role: &'a Role) -> &'a [String] {
        if role.is_path_all() {
            &self.path_all
        } else {
            role.declared_paths()
        }
    }
}
