//! S3Vault Connection - Cloud service plumbing
//!
//! This crate provides:
//! - Execution-context metadata (instance or local)
//! - Service client construction from region, profile and session token
//! - Key-management and security-token service seams
//! - Encryption key resolution with ordered fallback
//! - The cached session token

pub mod connection;
pub mod identity;
pub mod keys;
pub mod metadata;
pub mod resolver;
pub mod token;

pub use connection::{ConnectionFactory, ServiceClient, ServiceKind};
pub use identity::{
    AssumeRoleRequest, AssumedCredentials, AwsIdentityService, CallerIdentity, IdentityService,
    MemoryIdentityService,
};
pub use keys::{AwsKeyService, KeyService, MemoryKeyService};
pub use metadata::{
    metadata_provider, InstanceMetadata, LocalMetadata, MetadataProvider, StaticMetadata,
    INSTANCE_METADATA_ENDPOINT,
};
pub use resolver::{alias_id, KeyResolver};
pub use token::{ResolvedToken, SessionRequest, TokenFactory, DEFAULT_TOKEN_FILENAME};
