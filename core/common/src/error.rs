//! Common error types for S3Vault.

use thiserror::Error;

/// Top-level error type for S3Vault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Declarative vault configuration is malformed or incomplete.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Role definition carries invalid privileges.
    #[error("Role error: {0}")]
    Role(String),

    /// No encryption key could be resolved through any fallback.
    #[error("Key resolution error: {0}")]
    KeyResolution(String),

    /// Storage object does not exist.
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Attempted to rewrite an object that carries no encryption key.
    #[error("Unencrypted object: {0}")]
    UnencryptedObject(String),

    /// Execution-context metadata could not be read.
    #[error("Metadata unavailable: {0}")]
    MetadataUnavailable(String),

    /// Execution context has no role.
    #[error("Role unavailable: {0}")]
    RoleUnavailable(String),

    /// Execution context has no instance id.
    #[error("Instance id unavailable: {0}")]
    InstanceIdUnavailable(String),

    /// Session token could not be created.
    #[error("Token error: {0}")]
    TokenFactory(String),

    /// Malformed dot-path, object name or structured content.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dot-path does not address an existing value.
    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    /// Service client could not be built.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Object storage call failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Key-management or security-token call failed.
    #[error("Key service error: {0}")]
    KeyService(String),

    /// Template could not be parsed or rendered.
    #[error("Template error: {0}")]
    Template(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable type name used when reporting an error at the CLI boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigException",
            Error::Role(_) => "RoleException",
            Error::KeyResolution(_) => "KMSResolverException",
            Error::ObjectNotFound(_) => "ObjectNotFoundException",
            Error::UnencryptedObject(_) => "UnencryptedObjectError",
            Error::MetadataUnavailable(_) => "MetadataUnavailable",
            Error::RoleUnavailable(_) => "RoleUnavailable",
            Error::InstanceIdUnavailable(_) => "InstanceIdUnavailable",
            Error::TokenFactory(_) => "TokenFactoryException",
            Error::Validation(_) => "ValidationError",
            Error::PropertyNotFound(_) => "KeyError",
            Error::Connection(_) => "ConnectionError",
            Error::Storage(_) => "StorageError",
            Error::KeyService(_) => "KeyServiceError",
            Error::Template(_) => "TemplateError",
            Error::Serialization(_) => "SerializationError",
            Error::Io(_) => "IOError",
        }
    }

    /// Whether this error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ObjectNotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
