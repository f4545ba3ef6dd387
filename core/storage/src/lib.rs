//! Object storage abstraction for S3Vault.
//!
//! This module provides a trait-based interface over the object storage
//! service holding the vault (S3 in production, memory in tests).
//!
//! # Design Principles
//! - Provider isolation: No service-specific logic in the vault module
//! - Async operations: All I/O operations are async
//! - Encryption is delegated: every write is server-side encrypted with a
//!   caller-supplied key, every read is decrypted by the service
//! - Unified error semantics: missing keys surface as `ObjectNotFound`

pub mod memory;
pub mod provider;
pub mod s3;

pub use memory::MemoryStorage;
pub use provider::{ObjectMetadata, ObjectStorage, ObjectSummary, SSE_KMS};
pub use s3::S3Storage;
