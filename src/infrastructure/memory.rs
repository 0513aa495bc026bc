//! In-process implementations of every port. Used by the test suites and by
//! `DATABASE_TYPE=memory` local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    error::ImportError,
    models::{
        ImportJob, ImportMessage, JobFilter, JobPage, JobProgress, JobStatus, JobTransition, NewProduct,
        ReceivedMessage, RowError, StoredBlob,
    },
    ports::{BlobStore, JobStore, ProductRepository, QueueConsumer, QueuePublisher},
};
use crate::infrastructure::s3_adapter::object_key;

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, ImportJob>>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a job wholesale, bypassing the state machine. Test setup only.
    pub async fn put(&self, job: ImportJob) {
        self.jobs.lock().await.insert(job.id.clone(), job);
    }

    /// Makes every call fail with a database error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ImportError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ImportError::Database("job store unavailable".to_string()));
        }
        Ok(())
    }

    async fn mutate<F>(&self, job_id: &str, change: F) -> Result<ImportJob, ImportError>
    where
        F: FnOnce(&mut ImportJob) -> Result<(), ImportError> + Send,
    {
        self.check_available()?;
        let mut jobs = self.jobs.lock().await;
        let stored = jobs
            .get_mut(job_id)
            .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;
        let mut updated = stored.clone();
        change(&mut updated)?;
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, mut job: ImportJob) -> Result<ImportJob, ImportError> {
        self.check_available()?;
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(ImportError::ConcurrentModification(job.id));
        }
        job.version = 1;
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<ImportJob>, ImportError> {
        self.check_available()?;
        Ok(self.jobs.lock().await.get(job_id).cloned())
    }

    async fn transition(&self, job_id: &str, transition: JobTransition) -> Result<ImportJob, ImportError> {
        self.mutate(job_id, |job| job.apply(transition, Utc::now())).await
    }

    async fn update_progress(&self, job_id: &str, progress: JobProgress) -> Result<ImportJob, ImportError> {
        self.mutate(job_id, |job| job.record_progress(progress, Utc::now())).await
    }

    async fn append_error(&self, job_id: &str, error: RowError, cap: usize) -> Result<ImportJob, ImportError> {
        self.mutate(job_id, |job| job.push_error(error, cap, Utc::now())).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage, ImportError> {
        self.check_available()?;
        let jobs = self.jobs.lock().await;
        Ok(JobPage::paginate(jobs.values().cloned(), filter))
    }

    async fn list_stale(&self, inactive_since: DateTime<Utc>) -> Result<Vec<ImportJob>, ImportError> {
        self.check_available()?;
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .filter(|job| job.last_activity() < inactive_since)
            .cloned()
            .collect())
    }
}

pub struct InMemoryBlobStore {
    bucket: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new("memory-imports")
    }
}

impl InMemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every call fail with a storage error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<(), ImportError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ImportError::Storage("blob store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, content: &[u8], file_name: &str, owner: &str) -> Result<StoredBlob, ImportError> {
        self.check_available()?;
        let key = object_key(owner, Utc::now());
        self.objects.lock().await.insert(key.clone(), content.to_vec());
        debug!("Stored {} bytes in memory under {}", content.len(), key);
        Ok(StoredBlob {
            bucket: self.bucket.clone(),
            key,
            file_name: file_name.to_string(),
        })
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, ImportError> {
        self.check_available()?;
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ImportError::BlobNotFound { key: key.to_string() })
    }

    async fn delete(&self, key: &str) -> Result<(), ImportError> {
        self.check_available()?;
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

struct QueuedMessage {
    message_id: String,
    body: String,
    receipt_handle: Option<String>,
    visible_at: Instant,
    receive_count: u32,
}

/// Queue with visibility leases. In FIFO mode a job id is accepted once and
/// every later publish of it returns the original message id.
pub struct InMemoryQueue {
    fifo: bool,
    messages: Mutex<VecDeque<QueuedMessage>>,
    dedup: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
    extensions: AtomicUsize,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::fifo()
    }
}

impl InMemoryQueue {
    pub fn fifo() -> Self {
        Self::with_mode(true)
    }

    pub fn standard() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(fifo: bool) -> Self {
        Self {
            fifo,
            messages: Mutex::new(VecDeque::new()),
            dedup: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            extensions: AtomicUsize::new(0),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Enqueues an arbitrary body, bypassing serialization.
    pub async fn push_raw(&self, body: impl Into<String>) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.messages.lock().await.push_back(QueuedMessage {
            message_id: message_id.clone(),
            body: body.into(),
            receipt_handle: None,
            visible_at: Instant::now(),
            receive_count: 0,
        });
        message_id
    }

    /// Messages not yet deleted, visible or in flight.
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn visibility_extensions(&self) -> usize {
        self.extensions.load(Ordering::SeqCst)
    }

    /// Makes every in-flight message visible again, as if its lease expired.
    pub async fn expire_leases(&self) {
        let now = Instant::now();
        for message in self.messages.lock().await.iter_mut() {
            message.visible_at = now;
        }
    }

    fn check_available(&self) -> Result<(), ImportError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ImportError::Queue("queue unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueuePublisher for InMemoryQueue {
    async fn publish(&self, message: &ImportMessage) -> Result<String, ImportError> {
        self.check_available()?;
        let body = serde_json::to_string(message).map_err(|e| ImportError::Queue(e.to_string()))?;

        if self.fifo {
            let mut dedup = self.dedup.lock().await;
            if let Some(existing) = dedup.get(&message.job_id) {
                debug!("Duplicate publish for job {} collapsed into {}", message.job_id, existing);
                return Ok(existing.clone());
            }
            let message_id = self.push_raw(body).await;
            dedup.insert(message.job_id.clone(), message_id.clone());
            return Ok(message_id);
        }

        Ok(self.push_raw(body).await)
    }
}

#[async_trait]
impl QueueConsumer for InMemoryQueue {
    async fn receive(&self, wait: Duration, visibility: Duration) -> Result<Option<ReceivedMessage>, ImportError> {
        self.check_available()?;
        {
            let now = Instant::now();
            let mut messages = self.messages.lock().await;
            if let Some(message) = messages.iter_mut().find(|m| m.visible_at <= now) {
                let receipt_handle = Uuid::new_v4().to_string();
                message.receipt_handle = Some(receipt_handle.clone());
                message.visible_at = now + visibility;
                message.receive_count += 1;
                debug!("Delivering message {} (receive #{})", message.message_id, message.receive_count);
                return Ok(Some(ReceivedMessage {
                    message_id: message.message_id.clone(),
                    receipt_handle,
                    body: message.body.clone(),
                }));
            }
        }
        tokio::time::sleep(wait.min(Duration::from_millis(20))).await;
        Ok(None)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), ImportError> {
        self.check_available()?;
        let mut messages = self.messages.lock().await;
        let position = messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| ImportError::Queue(format!("receipt handle {} is invalid", receipt_handle)))?;
        messages.remove(position);
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, visibility: Duration) -> Result<(), ImportError> {
        self.check_available()?;
        let mut messages = self.messages.lock().await;
        let message = messages
            .iter_mut()
            .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| ImportError::Queue(format!("receipt handle {} is invalid", receipt_handle)))?;
        message.visible_at = Instant::now() + visibility;
        self.extensions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Products keyed by SKU, mirroring the unique-SKU constraint of real storage.
#[derive(Default)]
pub struct InMemoryProductRepository {
    products: Mutex<HashMap<String, (String, NewProduct)>>,
}

impl InMemoryProductRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.products.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, sku: &str) -> Option<NewProduct> {
        self.products.lock().await.get(sku).map(|(_, p)| p.clone())
    }
}

#[async_trait]
impl ProductRepository for InMemoryProductRepository {
    async fn insert(&self, product: &NewProduct) -> Result<String, ImportError> {
        let mut products = self.products.lock().await;
        if products.contains_key(&product.sku) {
            return Err(ImportError::DuplicateSku {
                sku: product.sku.clone(),
            });
        }
        let id = Uuid::new_v4().to_string();
        products.insert(product.sku.clone(), (id.clone(), product.clone()));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(job_id: &str) -> ImportMessage {
        ImportMessage {
            job_id: job_id.to_string(),
            bucket: "b".to_string(),
            key: "imports/ana/x.csv".to_string(),
            file_name: "x.csv".to_string(),
            owner: "ana".to_string(),
            timestamp: Utc::now(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn fifo_collapses_duplicate_job_ids() {
        let queue = InMemoryQueue::fifo();
        let first = queue.publish(&message("job-1")).await.unwrap();
        let second = queue.publish(&message("job-1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.len().await, 1);

        let standard = InMemoryQueue::standard();
        standard.publish(&message("job-1")).await.unwrap();
        standard.publish(&message("job-1")).await.unwrap();
        assert_eq!(standard.len().await, 2);
    }

    #[tokio::test]
    async fn leased_message_is_hidden_until_expiry() {
        let queue = InMemoryQueue::fifo();
        queue.publish(&message("job-1")).await.unwrap();
        let wait = Duration::from_millis(1);
        let lease = Duration::from_secs(300);

        let received = queue.receive(wait, lease).await.unwrap().unwrap();
        assert!(queue.receive(wait, lease).await.unwrap().is_none());

        queue.expire_leases().await;
        let again = queue.receive(wait, lease).await.unwrap().unwrap();
        assert_eq!(again.message_id, received.message_id);
        assert!(queue.delete(&received.receipt_handle).await.is_err());
        queue.delete(&again.receipt_handle).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn missing_blob_is_distinguishable() {
        let store = InMemoryBlobStore::default();
        let err = store.download("imports/nope.csv").await.unwrap_err();
        assert!(matches!(err, ImportError::BlobNotFound { .. }));

        store.set_unavailable(true);
        let err = store.download("imports/nope.csv").await.unwrap_err();
        assert!(matches!(err, ImportError::Storage(_)));
    }
}
