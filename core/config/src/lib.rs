//! Declarative vault configuration for S3Vault.
//!
//! This module provides:
//! - Parsing of the `vaultlib` YAML document into roles
//! - Role privileges and lazy key ARN lookup
//! - Generation of the IAM, KMS and bucket policy template for a config

pub mod config;
pub mod policy;
pub mod role;

pub use config::{VaultConfig, CONFIG_SECTION, EXAMPLE_CONFIG, LEGACY_CONFIG_SECTION};
pub use policy::{cfsanitize, PolicyGenerator};
pub use role::{Privilege, Role, PATH_ALL};
