use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    error::ImportError,
    models::{
        ImportJob, ImportMessage, JobFilter, JobPage, JobProgress, JobTransition, NewProduct,
        ReceivedMessage, RowError, StoredBlob,
    },
};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the raw CSV under an owner-namespaced, collision-free key.
    async fn upload(&self, content: &[u8], file_name: &str, owner: &str) -> Result<StoredBlob, ImportError>;

    /// Fails with `ImportError::BlobNotFound` when the key does not exist.
    async fn download(&self, key: &str) -> Result<Vec<u8>, ImportError>;

    async fn delete(&self, key: &str) -> Result<(), ImportError>;
}

/// Persistence for `ImportJob`. Every mutating call is atomic per job id.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: ImportJob) -> Result<ImportJob, ImportError>;

    async fn get(&self, job_id: &str) -> Result<Option<ImportJob>, ImportError>;

    async fn transition(&self, job_id: &str, transition: JobTransition) -> Result<ImportJob, ImportError>;

    async fn update_progress(&self, job_id: &str, progress: JobProgress) -> Result<ImportJob, ImportError>;

    async fn append_error(&self, job_id: &str, error: RowError, cap: usize) -> Result<ImportJob, ImportError>;

    async fn list(&self, filter: &JobFilter) -> Result<JobPage, ImportError>;

    /// PROCESSING jobs with no activity since `inactive_since`.
    async fn list_stale(&self, inactive_since: DateTime<Utc>) -> Result<Vec<ImportJob>, ImportError>;
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// Inserts one product and returns its id. A product with the same SKU
    /// already in storage yields `ImportError::DuplicateSku`.
    async fn insert(&self, product: &NewProduct) -> Result<String, ImportError>;
}

#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Returns the transport message id.
    async fn publish(&self, message: &ImportMessage) -> Result<String, ImportError>;
}

#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Long-polls for at most one message, hiding it for `visibility`.
    async fn receive(&self, wait: Duration, visibility: Duration) -> Result<Option<ReceivedMessage>, ImportError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), ImportError>;

    async fn extend_visibility(&self, receipt_handle: &str, visibility: Duration) -> Result<(), ImportError>;
}
