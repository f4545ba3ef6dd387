//! Common types used throughout S3Vault.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage scope of a vault: a bucket plus a path prefix inside it.
///
/// The prefix is kept without leading or trailing separators, so
/// `VaultLocation::new("b", "/a/b/")` and `VaultLocation::new("b", "a/b")`
/// address the same objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultLocation {
    bucket: String,
    path_prefix: String,
}

impl VaultLocation {
    /// Create a new location.
    ///
    /// # Errors
    /// - Returns error if `bucket` is empty or contains a separator
    pub fn new(bucket: impl Into<String>, path_prefix: impl Into<String>) -> crate::Result<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(crate::Error::Validation(
                "Bucket name cannot be empty".to_string(),
            ));
        }
        if bucket.contains('/') {
            return Err(crate::Error::Validation(format!(
                "Bucket name cannot contain separators: {}",
                bucket
            )));
        }
        let path_prefix = path_prefix.into().trim_matches('/').to_string();
        Ok(Self {
            bucket,
            path_prefix,
        })
    }

    /// Get the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Get the path prefix (no leading or trailing `/`).
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Prefix used when listing the scope: empty or ending in `/`.
    pub fn list_prefix(&self) -> String {
        if self.path_prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.path_prefix)
        }
    }

    /// Full storage key of an object named `name` in this scope.
    pub fn object_key(&self, name: &str) -> String {
        format!("{}{}", self.list_prefix(), name)
    }
}

impl fmt::Display for VaultLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.list_prefix())
    }
}

/// CLI address of a vault scope and, optionally, an object inside it.
///
/// Parsed from `<bucket>/<path>/[<name>]`: a trailing `/` means no name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCoordinates {
    pub location: VaultLocation,
    pub name: Option<String>,
}

impl RemoteCoordinates {
    /// Parse remote coordinates.
    ///
    /// # Errors
    /// - Returns error if no bucket is present
    pub fn parse(remote: &str) -> crate::Result<Self> {
        let remote = remote.trim().trim_start_matches("s3://").trim_start_matches('/');
        let (bucket, rest) = match remote.split_once('/') {
            Some((bucket, rest)) => (bucket, rest),
            None => (remote, ""),
        };

        let (path, name) = if rest.is_empty() || rest.ends_with('/') {
            (rest, None)
        } else {
            match rest.rsplit_once('/') {
                Some((path, name)) => (path, Some(name.to_string())),
                None => ("", Some(rest.to_string())),
            }
        };

        Ok(Self {
            location: VaultLocation::new(bucket, path)?,
            name,
        })
    }
}

/// Return true if a storage key names a file rather than a directory marker.
///
/// Keys ending in `/` have no final path segment and are directory markers.
pub fn is_file_key(key: &str) -> bool {
    key.rsplit('/').next().is_some_and(|name| !name.is_empty())
}

/// Final path segment of a storage key.
pub fn object_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
