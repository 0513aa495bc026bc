use async_trait::async_trait;
use aws_sdk_s3::{primitives::ByteStream, types::ServerSideEncryption, Client};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::domain::{error::ImportError, models::StoredBlob, ports::BlobStore};

/// `imports/{owner}/{YYYYmmdd_HHMMSS}_{8 hex}.csv`. The owner segment is
/// reduced to key-safe characters.
pub fn object_key(owner: &str, now: DateTime<Utc>) -> String {
    let owner: String = owner
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '@') { c } else { '_' })
        .collect();
    let owner = if owner.is_empty() { "anonimo".to_string() } else { owner };
    let suffix = Uuid::new_v4().simple().to_string();
    format!("imports/{}/{}_{}.csv", owner, now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// S3 object metadata must be ASCII.
fn metadata_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect()
}

pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        debug!("Initializing S3 blob store for bucket: {}", bucket);
        Self { client, bucket }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(&self, content: &[u8], file_name: &str, owner: &str) -> Result<StoredBlob, ImportError> {
        let now = Utc::now();
        let key = object_key(owner, now);
        debug!("Uploading {} bytes to s3://{}/{}", content.len(), self.bucket, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(content.to_vec()))
            .content_type("text/csv")
            .server_side_encryption(ServerSideEncryption::Aes256)
            .metadata("usuario", metadata_value(owner))
            .metadata("fecha_subida", now.to_rfc3339())
            .metadata("nombre_original", metadata_value(file_name))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to upload s3://{}/{}: {}", self.bucket, key, e);
                ImportError::Storage(e.to_string())
            })?;

        info!("Uploaded {} to s3://{}/{}", file_name, self.bucket, key);
        Ok(StoredBlob {
            bucket: self.bucket.clone(),
            key,
            file_name: file_name.to_string(),
        })
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, ImportError> {
        debug!("Fetching s3://{}/{}", self.bucket, key);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map_or(false, |se| se.is_no_such_key()) {
                    error!("Object not found: s3://{}/{}", self.bucket, key);
                    ImportError::BlobNotFound { key: key.to_string() }
                } else {
                    error!("Failed to fetch s3://{}/{}: {}", self.bucket, key, e);
                    ImportError::Storage(e.to_string())
                }
            })?;

        let bytes = response.body.collect().await.map_err(|e| {
            error!("Failed to read body of s3://{}/{}: {}", self.bucket, key, e);
            ImportError::Storage(e.to_string())
        })?;
        let bytes = bytes.into_bytes().to_vec();
        debug!("Fetched {} bytes from s3://{}/{}", bytes.len(), self.bucket, key);
        Ok(bytes)
    }

    async fn delete(&self, key: &str) -> Result<(), ImportError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to delete s3://{}/{}: {}", self.bucket, key, e);
                ImportError::Storage(e.to_string())
            })?;
        info!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn keys_are_namespaced_and_unique() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let a = object_key("ana", now);
        let b = object_key("ana", now);
        assert!(a.starts_with("imports/ana/20250304_050607_"));
        assert!(a.ends_with(".csv"));
        assert_eq!(a.len(), "imports/ana/20250304_050607_".len() + 8 + 4);
        assert_ne!(a, b);
    }

    #[test]
    fn owner_is_sanitized() {
        let now = Utc::now();
        assert!(object_key("josé/../x", now).starts_with("imports/jos_____x/"));
        assert!(object_key("  ", now).starts_with("imports/anonimo/"));
    }

    #[test]
    fn metadata_is_ascii() {
        assert_eq!(metadata_value("Año 2025.csv"), "A_o 2025.csv");
    }
}
