//! S3 object storage backend.
//!
//! Objects are written with SSE-KMS pinned to the caller's key and read
//! back through S3's transparent decryption.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::provider::{ObjectMetadata, ObjectStorage, ObjectSummary};
use s3vault_common::{Error, Result};

/// S3 storage backend.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    /// Wrap an existing S3 client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from a loaded SDK configuration.
    ///
    /// A custom endpoint switches to path-style addressing, which most
    /// S3-compatible services require.
    pub fn from_sdk_config(sdk_config: &SdkConfig, endpoint: Option<&str>) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);
        if let Some(endpoint_url) = endpoint {
            debug!("Using custom S3 endpoint: {}", endpoint_url);
            builder = builder.endpoint_url(endpoint_url).force_path_style(true);
        }
        Self::new(Client::from_conf(builder.build()))
    }

    /// Get the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn to_chrono(value: Option<&S3DateTime>) -> Option<DateTime<Utc>> {
    value.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
}

fn to_size(value: Option<i64>) -> Option<u64> {
    value.and_then(|size| u64::try_from(size).ok())
}

#[async_trait]
impl ObjectStorage for S3Storage {
    fn name(&self) -> &str {
        "s3"
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: i32,
    ) -> Result<Vec<ObjectSummary>> {
        debug!("Listing objects in s3://{}/{}", bucket, prefix);

        let resp = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(max_keys)
            .send()
            .await
            .map_err(|e| {
                error!(bucket, prefix, "Failed to list objects: {}", DisplayErrorContext(&e));
                Error::Storage(format!(
                    "Failed to list s3://{}/{}: {}",
                    bucket,
                    prefix,
                    DisplayErrorContext(&e)
                ))
            })?;

        let summaries: Vec<ObjectSummary> = resp
            .contents()
            .iter()
            .filter_map(|object| {
                object.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    size: to_size(object.size()),
                    last_modified: to_chrono(object.last_modified()),
                    etag: object.e_tag().map(String::from),
                })
            })
            .collect();

        debug!("Found {} objects", summaries.len());
        Ok(summaries)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        debug!("Fetching header: s3://{}/{}", bucket, key);

        let resp = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Error::ObjectNotFound(format!("s3://{}/{}", bucket, key))
                } else {
                    error!(
                        bucket,
                        key,
                        "Exception while fetching header: {}",
                        DisplayErrorContext(&service_error)
                    );
                    Error::Storage(format!(
                        "Failed to fetch header for s3://{}/{}: {}",
                        bucket,
                        key,
                        DisplayErrorContext(&service_error)
                    ))
                }
            })?;

        Ok(ObjectMetadata {
            kms_key_id: resp.ssekms_key_id().map(String::from),
            server_side_encryption: resp
                .server_side_encryption()
                .map(|sse| sse.as_str().to_string()),
            content_length: to_size(resp.content_length()),
            content_type: resp.content_type().map(String::from),
            etag: resp.e_tag().map(String::from),
            last_modified: to_chrono(resp.last_modified()),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        debug!("Downloading object: s3://{}/{}", bucket, key);

        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Error::ObjectNotFound(format!("s3://{}/{}", bucket, key))
                } else {
                    error!(
                        bucket,
                        key,
                        "Failed to get object: {}",
                        DisplayErrorContext(&service_error)
                    );
                    Error::Storage(format!(
                        "Failed to get s3://{}/{}: {}",
                        bucket,
                        key,
                        DisplayErrorContext(&service_error)
                    ))
                }
            })?;

        let body = resp.body.collect().await.map_err(|e| {
            Error::Storage(format!(
                "Unable to read the content for key {}: {}",
                key, e
            ))
        })?;

        let data = body.into_bytes().to_vec();
        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), bucket, key);
        Ok(data)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        kms_key_id: &str,
    ) -> Result<ObjectMetadata> {
        let size = body.len() as u64;
        debug!("Uploading object ({} bytes): s3://{}/{}", size, bucket, key);

        let resp = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .server_side_encryption(ServerSideEncryption::AwsKms)
            .ssekms_key_id(kms_key_id)
            .send()
            .await
            .map_err(|e| {
                error!(bucket, key, "Failed to put object: {}", DisplayErrorContext(&e));
                Error::Storage(format!(
                    "Failed to put s3://{}/{}: {}",
                    bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;

        info!("Uploaded object to s3://{}/{}", bucket, key);

        Ok(ObjectMetadata {
            kms_key_id: resp
                .ssekms_key_id()
                .map(String::from)
                .or_else(|| Some(kms_key_id.to_string())),
            server_side_encryption: resp
                .server_side_encryption()
                .map(|sse| sse.as_str().to_string()),
            content_length: Some(size),
            content_type: None,
            etag: resp.e_tag().map(String::from),
            last_modified: None,
        })
    }
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_chrono() {
        let dt = S3DateTime::from_secs(1_700_000_000);
        let converted = to_chrono(Some(&dt)).unwrap();
        assert_eq!(converted.timestamp(), 1_700_000_000);
        assert!(to_chrono(None).is_none());
    }

    #[test]
    fn test_to_size() {
        assert_eq!(to_size(Some(42)), Some(42));
        assert_eq!(to_size(Some(-1)), None);
        assert_eq!(to_size(None), None);
    }
}
