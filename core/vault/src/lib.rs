//! Vault engine for S3Vault.
//!
//! This module provides:
//! - Lazy handles to encrypted objects with dot-path field access
//! - An object store scoped to a bucket and path prefix
//! - Template rendering against vault objects
//! - The vault facade composing storage and key resolution
//!
//! # Architecture
//! The facade sits between the CLI and the storage backend. Encryption is
//! server-side: the vault only decides which key every write is pinned to.

pub mod object;
pub mod store;
pub mod template;
pub mod vault;

pub use object::EncryptedObject;
pub use store::{ObjectStore, ALLOW_DOT_NAMES_ENV, MAX_LISTED_OBJECTS};
pub use template::TemplateRenderer;
pub use vault::{KeySelection, S3Vault, EMPTY_CONFIG};
