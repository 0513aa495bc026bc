use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::application::{
    csv_validator::CsvUpload,
    import_router::{count_data_rows, ImportRouter, ProcessingMode},
    product_importer::{NoProgress, ProductImporter},
};
use crate::domain::{
    error::ImportError,
    models::{ImportJob, ImportMessage, ImportOutcome, JobFilter, JobPage, JobStatus, JobTransition},
    ports::{BlobStore, JobStore, QueuePublisher},
};

pub const DEFAULT_OWNER: &str = "sistema";

/// Blob storage and queue, present only when the asynchronous pipeline is
/// enabled.
#[derive(Clone)]
pub struct AsyncBackend {
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn QueuePublisher>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportRequest {
    pub upload: CsvUpload,
    pub registered_by: Option<String>,
    pub force_async: bool,
}

#[derive(Debug, Clone)]
pub enum SubmitResult {
    Sync(ImportOutcome),
    Queued(ImportJob),
}

pub struct ImportService {
    router: ImportRouter,
    importer: Arc<ProductImporter>,
    jobs: Arc<dyn JobStore>,
    async_backend: Option<AsyncBackend>,
    max_retries: u32,
}

impl ImportService {
    pub fn new(
        router: ImportRouter,
        importer: Arc<ProductImporter>,
        jobs: Arc<dyn JobStore>,
        async_backend: Option<AsyncBackend>,
        max_retries: u32,
    ) -> Self {
        Self {
            router,
            importer,
            jobs,
            async_backend,
            max_retries,
        }
    }

    pub fn async_enabled(&self) -> bool {
        self.async_backend.is_some()
    }

    pub async fn submit(&self, request: ImportRequest) -> Result<SubmitResult, ImportError> {
        // Step 1: Reject missing or non-CSV uploads
        let (file_name, content) = request.upload.checked()?;
        info!("Received import {} ({} bytes)", file_name, content.len());
        let registered_by = request
            .registered_by
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());

        // Step 2: Route on a cheap row count
        let estimated_rows = count_data_rows(content);
        let mode = self
            .router
            .decide(estimated_rows, request.force_async, self.async_enabled())?;
        debug!("Step 2: {} estimated rows routed {:?}", estimated_rows, mode);

        // Step 3: Structural validation happens before anything is stored
        let parsed = self.importer.validator().parse_bytes(content).map_err(|e| {
            error!("Structural validation failed for {}: {}", file_name, e);
            e
        })?;

        let backend = match (mode, &self.async_backend) {
            (ProcessingMode::Sync, _) => {
                debug!("Step 4: Importing {} rows synchronously", parsed.rows.len());
                let outcome = self.importer.import(&parsed, registered_by, &mut NoProgress).await?;
                info!(
                    "✅ Synchronous import of {} done: {} ok, {} failed",
                    file_name, outcome.successful, outcome.failed
                );
                return Ok(SubmitResult::Sync(outcome));
            }
            (ProcessingMode::Async, Some(backend)) => backend,
            (ProcessingMode::Async, None) => {
                return Err(ImportError::AsyncUnavailable("backend no configurado".to_string()));
            }
        };

        // Step 4: Upload, create the job and enqueue a reference to it
        let owner = registered_by.unwrap_or(DEFAULT_OWNER);
        debug!("Step 4: Uploading {} for {}", file_name, owner);
        let blob = backend.blobs.upload(content, file_name, owner).await.map_err(|e| {
            error!("Failed to upload {}: {}", file_name, e);
            e
        })?;

        let mut metadata = BTreeMap::new();
        metadata.insert("forzar_asincrono".to_string(), request.force_async.to_string());
        metadata.insert("tamano_bytes".to_string(), content.len().to_string());
        let job = ImportJob::new(&blob, owner, parsed.rows.len() as u64).with_metadata(metadata);
        let job = match self.jobs.create(job).await {
            Ok(job) => job,
            Err(e) => {
                error!("Failed to create import job for {}: {}", blob.key, e);
                if let Err(delete_err) = backend.blobs.delete(&blob.key).await {
                    warn!("Failed to remove orphaned upload {}: {}", blob.key, delete_err);
                }
                return Err(e);
            }
        };
        info!("Created import job {} for s3://{}/{}", job.id, blob.bucket, blob.key);

        let job = self.enqueue(backend, job).await?;
        Ok(SubmitResult::Queued(job))
    }

    pub async fn status(&self, job_id: &str) -> Result<ImportJob, ImportError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, ImportError> {
        debug!("Listing jobs with filter {:?}", filter);
        self.jobs.list(filter).await
    }

    /// Operator action; only PENDING or QUEUED jobs can be cancelled.
    pub async fn cancel(&self, job_id: &str) -> Result<ImportJob, ImportError> {
        self.status(job_id).await?;
        let job = self.jobs.transition(job_id, JobTransition::Cancel).await.map_err(|e| {
            warn!("Could not cancel job {}: {}", job_id, e);
            e
        })?;
        info!("Job {} cancelled", job_id);
        Ok(job)
    }

    /// Re-imports the blob of a FAILED job as a new job, bounded by the
    /// configured retry limit.
    pub async fn resubmit(&self, job_id: &str) -> Result<ImportJob, ImportError> {
        let backend = self
            .async_backend
            .as_ref()
            .ok_or_else(|| ImportError::AsyncUnavailable("backend no configurado".to_string()))?;
        let previous = self.status(job_id).await?;

        if previous.status != JobStatus::Failed {
            return Err(ImportError::InvalidTransition {
                job_id: previous.id,
                from: previous.status.to_string(),
                to: JobStatus::Pending.to_string(),
            });
        }
        if !previous.can_retry(self.max_retries) {
            return Err(ImportError::RetryLimitReached {
                job_id: previous.id,
                max_retries: self.max_retries,
            });
        }

        let job = self.jobs.create(ImportJob::resubmission_of(&previous)).await?;
        info!(
            "Resubmitting job {} as {} (attempt {} of {})",
            previous.id, job.id, job.retry_count, self.max_retries
        );
        self.enqueue(backend, job).await
    }

    async fn enqueue(&self, backend: &AsyncBackend, job: ImportJob) -> Result<ImportJob, ImportError> {
        let message = ImportMessage::for_job(&job);
        match backend.queue.publish(&message).await {
            Ok(message_id) => match self.jobs.transition(&job.id, JobTransition::Enqueue { message_id }).await {
                Ok(job) => {
                    info!("✅ Job {} queued ({})", job.id, job.status);
                    Ok(job)
                }
                // A worker picked the message up and settled the job first.
                Err(e @ ImportError::InvalidTransition { .. }) => {
                    let current = self.status(&job.id).await?;
                    if current.status == JobStatus::Pending {
                        return Err(e);
                    }
                    info!("Job {} already {} before its enqueue was recorded", current.id, current.status);
                    Ok(current)
                }
                Err(e) => Err(e),
            },
            Err(e) => {
                error!("Failed to publish job {}: {}", job.id, e);
                if let Err(mark_err) = self
                    .jobs
                    .transition(&job.id, JobTransition::fail(format!("Error al encolar el trabajo: {}", e)))
                    .await
                {
                    error!("Failed to mark job {} as FAILED: {}", job.id, mark_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::application::csv_validator::CsvValidator;
    use crate::infrastructure::memory::{InMemoryBlobStore, InMemoryJobStore, InMemoryProductRepository, InMemoryQueue};

    const HEADER: &str = "nombre,codigo_sku,categoria,precio_unitario,condiciones_almacenamiento,fecha_vencimiento,proveedor_id";

    struct Fixture {
        service: ImportService,
        jobs: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryQueue>,
        products: Arc<InMemoryProductRepository>,
    }

    fn fixture(with_async: bool) -> Fixture {
        let jobs = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::fifo());
        let products = Arc::new(InMemoryProductRepository::new());
        let importer = Arc::new(ProductImporter::new(Arc::new(CsvValidator::new()), products.clone(), 10));
        let backend = with_async.then(|| AsyncBackend {
            blobs: Arc::new(InMemoryBlobStore::default()),
            queue: queue.clone(),
        });
        let service = ImportService::new(ImportRouter::new(100), importer, jobs.clone(), backend, 2);
        Fixture {
            service,
            jobs,
            queue,
            products,
        }
    }

    fn request(rows: usize, force_async: bool) -> ImportRequest {
        let mut csv = format!("{HEADER}\n");
        for i in 0..rows {
            csv.push_str(&format!("P{i},SKU-{i:04},insumo,1.5,Seco,31/12/2026,1\n"));
        }
        ImportRequest {
            upload: CsvUpload::new("productos.csv", csv.into_bytes()),
            registered_by: Some("ana".to_string()),
            force_async,
        }
    }

    #[tokio::test]
    async fn small_file_is_imported_inline() {
        let fx = fixture(true);
        match fx.service.submit(request(99, false)).await.unwrap() {
            SubmitResult::Sync(outcome) => assert_eq!(outcome.successful, 99),
            other => panic!("expected sync, got {:?}", other),
        }
        assert_eq!(fx.products.len().await, 99);
        assert!(fx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn large_file_is_queued() {
        let fx = fixture(true);
        let job = match fx.service.submit(request(100, false)).await.unwrap() {
            SubmitResult::Queued(job) => job,
            other => panic!("expected queued, got {:?}", other),
        };
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.total_rows, 100);
        assert_eq!(job.owner, "ana");
        assert!(job.queue_message_id.is_some());
        assert_eq!(fx.queue.len().await, 1);
        assert_eq!(fx.products.len().await, 0);
    }

    #[tokio::test]
    async fn async_required_but_disabled_is_503_class() {
        let fx = fixture(false);
        let err = fx.service.submit(request(150, false)).await.unwrap_err();
        assert!(matches!(err, ImportError::AsyncUnavailable(_)));
        let err = fx.service.submit(request(1, true)).await.unwrap_err();
        assert!(matches!(err, ImportError::AsyncUnavailable(_)));
    }

    #[tokio::test]
    async fn header_only_is_rejected_without_job() {
        let fx = fixture(true);
        let err = fx.service.submit(request(0, true)).await.unwrap_err();
        assert!(matches!(err, ImportError::NoDataRows));
        let page = fx.jobs.list(&JobFilter::new(None, None, None, None)).await.unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn publish_failure_marks_job_failed() {
        let fx = fixture(true);
        fx.queue.set_unavailable(true);
        let err = fx.service.submit(request(120, false)).await.unwrap_err();
        assert!(matches!(err, ImportError::Queue(_)));

        let page = fx.jobs.list(&JobFilter::new(None, None, None, None)).await.unwrap();
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.jobs[0].status, JobStatus::Failed);
        assert!(page.jobs[0].error_message.as_deref().unwrap().contains("encolar"));
    }

    #[tokio::test]
    async fn cancel_and_resubmit_rules() {
        let fx = fixture(true);
        let job = match fx.service.submit(request(1, true)).await.unwrap() {
            SubmitResult::Queued(job) => job,
            other => panic!("expected queued, got {:?}", other),
        };

        let err = fx.service.resubmit(&job.id).await.unwrap_err();
        assert!(matches!(err, ImportError::InvalidTransition { .. }));

        let cancelled = fx.service.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(fx.service.cancel(&job.id).await.is_err());
        assert!(matches!(
            fx.service.cancel("missing").await,
            Err(ImportError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resubmission_is_bounded() {
        let fx = fixture(true);
        let job = match fx.service.submit(request(1, true)).await.unwrap() {
            SubmitResult::Queued(job) => job,
            other => panic!("expected queued, got {:?}", other),
        };
        fx.jobs.transition(&job.id, JobTransition::fail("boom")).await.unwrap();

        let retry_1 = fx.service.resubmit(&job.id).await.unwrap();
        assert_eq!(retry_1.retry_count, 1);
        assert_eq!(retry_1.status, JobStatus::Queued);
        assert_eq!(retry_1.blob_key, job.blob_key);

        fx.jobs.transition(&retry_1.id, JobTransition::fail("boom")).await.unwrap();
        let retry_2 = fx.service.resubmit(&retry_1.id).await.unwrap();
        fx.jobs.transition(&retry_2.id, JobTransition::fail("boom")).await.unwrap();

        let err = fx.service.resubmit(&retry_2.id).await.unwrap_err();
        assert!(matches!(err, ImportError::RetryLimitReached { max_retries: 2, .. }));
    }

    /// Publishes, then lets a "worker" claim (and optionally finish) the job
    /// before the service gets to record the enqueue.
    struct ClaimingPublisher {
        queue: Arc<InMemoryQueue>,
        jobs: Arc<InMemoryJobStore>,
        finish: bool,
    }

    #[async_trait]
    impl QueuePublisher for ClaimingPublisher {
        async fn publish(&self, message: &ImportMessage) -> Result<String, ImportError> {
            let message_id = self.queue.publish(message).await?;
            self.jobs
                .transition(&message.job_id, JobTransition::StartProcessing)
                .await?;
            if self.finish {
                self.jobs
                    .transition(&message.job_id, JobTransition::fail("archivo ilegible"))
                    .await?;
            }
            Ok(message_id)
        }
    }

    fn claiming_service(finish: bool) -> (ImportService, Arc<InMemoryJobStore>) {
        let jobs = Arc::new(InMemoryJobStore::new());
        let importer = Arc::new(ProductImporter::new(
            Arc::new(CsvValidator::new()),
            Arc::new(InMemoryProductRepository::new()),
            10,
        ));
        let backend = AsyncBackend {
            blobs: Arc::new(InMemoryBlobStore::default()),
            queue: Arc::new(ClaimingPublisher {
                queue: Arc::new(InMemoryQueue::fifo()),
                jobs: jobs.clone(),
                finish,
            }),
        };
        let service = ImportService::new(ImportRouter::new(100), importer, jobs.clone(), Some(backend), 2);
        (service, jobs)
    }

    #[tokio::test]
    async fn job_claimed_before_enqueue_is_recorded_still_counts_as_queued() {
        let (service, jobs) = claiming_service(false);
        let job = match service.submit(request(2, true)).await.unwrap() {
            SubmitResult::Queued(job) => job,
            other => panic!("expected queued, got {:?}", other),
        };
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.queue_message_id.is_some());

        let stored = jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.queue_message_id, job.queue_message_id);
    }

    #[tokio::test]
    async fn job_settled_before_enqueue_is_recorded_is_returned() {
        let (service, _jobs) = claiming_service(true);
        let job = match service.submit(request(2, true)).await.unwrap() {
            SubmitResult::Queued(job) => job,
            other => panic!("expected queued, got {:?}", other),
        };
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn upload_is_removed_when_job_cannot_be_created() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let blobs = Arc::new(InMemoryBlobStore::default());
        let queue = Arc::new(InMemoryQueue::fifo());
        let importer = Arc::new(ProductImporter::new(
            Arc::new(CsvValidator::new()),
            Arc::new(InMemoryProductRepository::new()),
            10,
        ));
        let backend = AsyncBackend {
            blobs: blobs.clone(),
            queue: queue.clone(),
        };
        let service = ImportService::new(ImportRouter::new(100), importer, jobs.clone(), Some(backend), 2);

        jobs.set_unavailable(true);
        let err = service.submit(request(3, true)).await.unwrap_err();
        assert!(matches!(err, ImportError::Database(_)));
        assert!(blobs.is_empty().await);
        assert!(queue.is_empty().await);
    }
}
