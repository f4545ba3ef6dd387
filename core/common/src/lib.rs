//! Common utilities and types shared across S3Vault modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{is_file_key, object_name, RemoteCoordinates, VaultLocation};
