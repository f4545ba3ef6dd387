//! Object store scoped to a bucket and path prefix.

use std::sync::Arc;
use tracing::{debug, info};

use crate::object::{EncryptedObject, PATH_SEPARATOR};
use s3vault_common::{Error, Result, VaultLocation};
use s3vault_storage::ObjectStorage;

/// Page size of a scope listing.
pub const MAX_LISTED_OBJECTS: i32 = 999;

/// Environment variable that lifts the dotted-name guard when set to `true`.
pub const ALLOW_DOT_NAMES_ENV: &str = "S3VAULT_ALLOW_DOT_NAMES";

fn env_allows_dot_names() -> bool {
    std::env::var(ALLOW_DOT_NAMES_ENV)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Lists, reads and writes the encrypted objects of one vault scope.
///
/// The listing is fetched once and reused until a write refreshes it.
/// Handles returned by the store live in that listing, so content loaded
/// or mutated through them is what [`ObjectStore::update_object`] writes.
pub struct ObjectStore {
    location: VaultLocation,
    storage: Arc<dyn ObjectStorage>,
    objects: Option<Vec<EncryptedObject>>,
    allow_dot_names: bool,
}

impl ObjectStore {
    /// Create a store for `location`.
    pub fn new(location: VaultLocation, storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            location,
            storage,
            objects: None,
            allow_dot_names: false,
        }
    }

    /// Allow dotted object names on every write.
    pub fn with_dot_names(mut self, allow: bool) -> Self {
        self.allow_dot_names = allow;
        self
    }

    /// Scope of this store.
    pub fn location(&self) -> &VaultLocation {
        &self.location
    }

    async fn fetch(&self) -> Result<Vec<EncryptedObject>> {
        let prefix = self.location.list_prefix();
        let summaries = self
            .storage
            .list_objects(self.location.bucket(), &prefix, MAX_LISTED_OBJECTS)
            .await?;

        let objects: Vec<EncryptedObject> = summaries
            .into_iter()
            .filter(|summary| summary.is_file())
            .filter(|summary| {
                summary
                    .key
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| !rest.contains('/'))
            })
            .map(|summary| {
                EncryptedObject::new(self.location.bucket(), summary, self.storage.clone())
            })
            .collect();

        debug!("Listed {} objects in {}", objects.len(), self.location);
        Ok(objects)
    }

    /// Objects of the scope, listed on first use.
    pub async fn objects(&mut self) -> Result<&mut Vec<EncryptedObject>> {
        let objects = match self.objects.take() {
            Some(objects) => objects,
            None => self.fetch().await?,
        };
        Ok(self.objects.insert(objects))
    }

    /// Names of the objects of the scope.
    pub async fn names(&mut self) -> Result<Vec<String>> {
        Ok(self
            .objects()
            .await?
            .iter()
            .map(|object| object.name().to_string())
            .collect())
    }

    /// Forget the listing; the next access lists again.
    pub fn refresh(&mut self) {
        self.objects = None;
    }

    /// Whether an object named `name` exists in the scope.
    pub async fn contains(&mut self, name: &str) -> Result<bool> {
        Ok(self
            .objects()
            .await?
            .iter()
            .any(|object| object.name() == name))
    }

    /// Handle of the object named `name`.
    ///
    /// # Errors
    /// - `ObjectNotFound` if the scope has no such object
    pub async fn get_object(&mut self, name: &str) -> Result<&mut EncryptedObject> {
        let missing = format!("{}{}", self.location, name);
        self.objects()
            .await?
            .iter_mut()
            .find(|object| object.name() == name)
            .ok_or(Error::ObjectNotFound(missing))
    }

    /// Write `content` as object `name`, encrypted with `key_arn`.
    ///
    /// # Preconditions
    /// - `name` is non-empty and has no `/`
    /// - `name` has no `.` unless `force_dot_names`, the store flag or the
    ///   environment toggle allows it
    ///
    /// # Postconditions
    /// - The listing is refreshed and the returned handle is the new object
    ///
    /// # Errors
    /// - `Validation` on a rejected name
    /// - Storage errors are returned unchanged
    pub async fn put_object(
        &mut self,
        name: &str,
        content: Vec<u8>,
        key_arn: &str,
        force_dot_names: bool,
    ) -> Result<&mut EncryptedObject> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::Validation(format!(
                "Invalid object name: '{}'",
                name
            )));
        }
        let allow_dots = force_dot_names || self.allow_dot_names || env_allows_dot_names();
        if name.contains(PATH_SEPARATOR) && !allow_dots {
            return Err(Error::Validation(format!(
                "Object names do not support . (dot): '{}'",
                name
            )));
        }

        info!(
            "Adding object: {}, size: {}, to bucket: {}, path: {}",
            name,
            content.len(),
            self.location.bucket(),
            self.location.path_prefix()
        );

        self.storage
            .put_object(
                self.location.bucket(),
                &self.location.object_key(name),
                content,
                key_arn,
            )
            .await?;

        self.refresh();
        self.get_object(name).await
    }

    /// Write back the in-memory content of object `name` with its own key.
    ///
    /// # Errors
    /// - `UnencryptedObject` if the stored object carries no key
    pub async fn update_object(&mut self, name: &str) -> Result<&mut EncryptedObject> {
        let (content, key_arn) = {
            let object = self.get_object(name).await?;
            let content = object.raw().await?.to_vec();
            let key_arn = object
                .kms_arn()
                .ok_or_else(|| {
                    Error::UnencryptedObject(format!(
                        "Unable to update unencrypted object {}",
                        name
                    ))
                })?
                .to_string();
            (content, key_arn)
        };

        self.put_object(name, content, &key_arn, true).await
    }
}
