use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::application::{
    job_reconciler::JobReconciler,
    product_importer::{ProductImporter, ProgressSink},
};
use crate::config::{ImportSettings, WorkerSettings};
use crate::domain::{
    error::ImportError,
    models::{ImportJob, ImportMessage, ImportOutcome, JobProgress, JobStatus, JobTransition, ReceivedMessage, RowError},
    ports::{BlobStore, JobStore, QueueConsumer},
};

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub wait_time: Duration,
    pub visibility_timeout: Duration,
    pub extend_interval: Duration,
    pub sweep_interval: Duration,
    pub error_details_cap: usize,
}

impl WorkerOptions {
    pub fn from_settings(worker: &WorkerSettings, import: &ImportSettings) -> Self {
        Self {
            wait_time: worker.wait_time(),
            visibility_timeout: worker.visibility_timeout(),
            extend_interval: worker.extend_interval(),
            sweep_interval: worker.sweep_interval(),
            error_details_cap: import.error_details_cap,
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default(), &ImportSettings::default())
    }
}

/// What happened to one delivered message.
#[derive(Debug, Clone)]
pub enum MessageOutcome {
    Completed(ImportJob),
    /// Job failed for a reason a redelivery cannot fix; message deleted.
    Failed(ImportJob),
    /// Job failed on an unexpected error; message kept for the queue's own
    /// redelivery and dead-letter policy.
    FailedKept(ImportJob),
    Poison,
    JobMissing,
    Cancelled,
    AlreadyTerminal,
    /// Job is PROCESSING under another lease; left for redelivery.
    LeftForRedelivery,
}

impl MessageOutcome {
    pub fn processed(&self) -> bool {
        matches!(self, MessageOutcome::Completed(_))
    }

    pub fn deletes_message(&self) -> bool {
        !matches!(self, MessageOutcome::FailedKept(_) | MessageOutcome::LeftForRedelivery)
    }
}

/// Writes progress to the job store and renews the message lease once
/// `extend_interval` has elapsed since the last renewal.
struct LeaseKeeper<'a> {
    jobs: &'a dyn JobStore,
    consumer: &'a dyn QueueConsumer,
    job_id: &'a str,
    receipt_handle: &'a str,
    options: &'a WorkerOptions,
    last_extended: Instant,
}

impl LeaseKeeper<'_> {
    async fn extend_if_due(&mut self) {
        if self.last_extended.elapsed() < self.options.extend_interval {
            return;
        }
        match self
            .consumer
            .extend_visibility(self.receipt_handle, self.options.visibility_timeout)
            .await
        {
            Ok(()) => {
                debug!("Extended lease for job {}", self.job_id);
                self.last_extended = Instant::now();
            }
            Err(e) => warn!("Failed to extend lease for job {}: {}", self.job_id, e),
        }
    }
}

#[async_trait]
impl ProgressSink for LeaseKeeper<'_> {
    async fn on_progress(&mut self, progress: JobProgress) -> Result<(), ImportError> {
        self.jobs.update_progress(self.job_id, progress).await?;
        debug!(
            "Job {} progress: {}/{} rows",
            self.job_id, progress.processed_rows, progress.total_rows
        );
        self.extend_if_due().await;
        Ok(())
    }

    async fn on_row_error(&mut self, error: &RowError) -> Result<(), ImportError> {
        self.jobs
            .append_error(self.job_id, error.clone(), self.options.error_details_cap)
            .await?;
        Ok(())
    }
}

pub struct ImportWorker {
    consumer: Arc<dyn QueueConsumer>,
    blobs: Arc<dyn BlobStore>,
    jobs: Arc<dyn JobStore>,
    importer: Arc<ProductImporter>,
    reconciler: JobReconciler,
    options: WorkerOptions,
}

impl ImportWorker {
    pub fn new(
        consumer: Arc<dyn QueueConsumer>,
        blobs: Arc<dyn BlobStore>,
        jobs: Arc<dyn JobStore>,
        importer: Arc<ProductImporter>,
        reconciler: JobReconciler,
        options: WorkerOptions,
    ) -> Self {
        Self {
            consumer,
            blobs,
            jobs,
            importer,
            reconciler,
            options,
        }
    }

    /// Polls until `shutdown` flips to true. A message already received is
    /// always finished before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ImportError> {
        info!("Starting import worker");
        let mut last_sweep: Option<Instant> = None;
        let mut poll_count: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_sweep.map_or(true, |at| at.elapsed() >= self.options.sweep_interval) {
                if let Err(e) = self.reconciler.fail_stale_jobs().await {
                    error!("Stale job sweep failed: {}", e);
                }
                last_sweep = Some(Instant::now());
            }

            poll_count += 1;
            debug!("Polling queue (attempt {})", poll_count);
            let received = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                received = self.consumer.receive(self.options.wait_time, self.options.visibility_timeout) => received,
            };

            match received {
                Ok(Some(message)) => {
                    if let Err(e) = self.process_message(&message).await {
                        error!("Failed to process message {}: {}", message.message_id, e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to receive from queue: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!("Import worker stopped");
        Ok(())
    }

    /// Receives and handles at most one message.
    pub async fn poll_once(&self) -> Result<Option<MessageOutcome>, ImportError> {
        match self
            .consumer
            .receive(self.options.wait_time, self.options.visibility_timeout)
            .await?
        {
            Some(message) => Ok(Some(self.process_message(&message).await?)),
            None => Ok(None),
        }
    }

    pub async fn process_message(&self, message: &ReceivedMessage) -> Result<MessageOutcome, ImportError> {
        info!("Processing message {}", message.message_id);
        let outcome = self.handle(message).await?;

        if outcome.deletes_message() {
            if let Err(e) = self.consumer.delete(&message.receipt_handle).await {
                error!("Failed to delete message {}: {}", message.message_id, e);
            }
        } else {
            debug!("Leaving message {} on the queue", message.message_id);
        }

        match &outcome {
            MessageOutcome::Completed(job) => info!(
                "✅ Job {} completed: {} ok, {} failed of {}",
                job.id, job.successful, job.failed, job.total_rows
            ),
            MessageOutcome::Failed(job) | MessageOutcome::FailedKept(job) => warn!(
                "Job {} failed: {}",
                job.id,
                job.error_message.as_deref().unwrap_or("unknown error")
            ),
            other => info!("Message {} not processed: {:?}", message.message_id, other),
        }
        Ok(outcome)
    }

    async fn handle(&self, message: &ReceivedMessage) -> Result<MessageOutcome, ImportError> {
        // Step 1: Parse the message body
        let import = match ImportMessage::parse(&message.body) {
            Ok(import) => import,
            Err(e) => {
                warn!("Discarding poison message {}: {}", message.message_id, e);
                debug!("Poison message body: {}", message.body);
                return Ok(MessageOutcome::Poison);
            }
        };
        debug!("Step 1: Message {} references job {}", message.message_id, import.job_id);

        // Step 2: Load the job and check it can still start
        let job = match self.jobs.get(&import.job_id).await? {
            Some(job) => job,
            None => {
                warn!("Job {} referenced by message {} does not exist", import.job_id, message.message_id);
                return Ok(MessageOutcome::JobMissing);
            }
        };
        if let Some(outcome) = Self::not_startable(&job) {
            return Ok(outcome);
        }
        if !import.bucket.is_empty() && import.bucket != job.blob_bucket {
            warn!(
                "Message {} names bucket {} but job {} was stored in {}",
                message.message_id, import.bucket, job.id, job.blob_bucket
            );
        }

        // Step 3: Claim the job
        let job = match self.jobs.transition(&job.id, JobTransition::StartProcessing).await {
            Ok(job) => job,
            Err(ImportError::InvalidTransition { .. }) => {
                let current = self
                    .jobs
                    .get(&import.job_id)
                    .await?
                    .ok_or_else(|| ImportError::JobNotFound(import.job_id.clone()))?;
                return Ok(Self::not_startable(&current).unwrap_or(MessageOutcome::LeftForRedelivery));
            }
            Err(e) => return Err(e),
        };
        debug!("Step 3: Job {} is PROCESSING", job.id);

        // Step 4: Download the CSV; a missing or empty blob will not fix itself
        let content = match self.blobs.download(&import.key).await {
            Ok(content) if !content.is_empty() => content,
            Ok(_) => {
                let job = self.fail(&job.id, "El archivo descargado está vacío".to_string()).await?;
                return Ok(MessageOutcome::Failed(job));
            }
            Err(e) => {
                error!("Failed to download {} for job {}: {}", import.key, job.id, e);
                let job = self.fail(&job.id, format!("Error al descargar el archivo: {}", e)).await?;
                return Ok(MessageOutcome::Failed(job));
            }
        };
        debug!("Step 4: Downloaded {} bytes", content.len());

        // Step 5: Structural checks, then row-by-row import
        let parsed = match self.importer.validator().parse_bytes(&content) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Job {} has an invalid CSV: {}", job.id, e);
                let job = self.fail(&job.id, format!("{}: {}", e.code(), e)).await?;
                return Ok(MessageOutcome::Failed(job));
            }
        };

        let mut sink = LeaseKeeper {
            jobs: self.jobs.as_ref(),
            consumer: self.consumer.as_ref(),
            job_id: &job.id,
            receipt_handle: &message.receipt_handle,
            options: &self.options,
            last_extended: Instant::now(),
        };
        let outcome: ImportOutcome = match self
            .importer
            .import(&parsed, Some(import.owner.as_str()), &mut sink)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Import of job {} aborted: {}", job.id, e);
                let job = self.fail(&job.id, format!("Error inesperado durante la importación: {}", e)).await?;
                return Ok(MessageOutcome::FailedKept(job));
            }
        };

        // Step 6: Record the final counters
        let transition = JobTransition::complete(&outcome, self.options.error_details_cap);
        match self.jobs.transition(&job.id, transition).await {
            Ok(job) => Ok(MessageOutcome::Completed(job)),
            Err(e) => {
                error!("Failed to complete job {}: {}", job.id, e);
                let job = self
                    .fail(&job.id, format!("Error al registrar la finalización del trabajo: {}", e))
                    .await?;
                Ok(MessageOutcome::FailedKept(job))
            }
        }
    }

    /// Outcome for a job that must not be started, or None if it can be.
    fn not_startable(job: &ImportJob) -> Option<MessageOutcome> {
        match job.status {
            JobStatus::Pending | JobStatus::Queued => None,
            JobStatus::Cancelled => {
                info!("Job {} was cancelled, discarding message", job.id);
                Some(MessageOutcome::Cancelled)
            }
            JobStatus::Completed | JobStatus::Failed => {
                info!("Job {} already {}, discarding redelivered message", job.id, job.status);
                Some(MessageOutcome::AlreadyTerminal)
            }
            JobStatus::Processing => {
                warn!("Job {} is already PROCESSING, leaving message for redelivery", job.id);
                Some(MessageOutcome::LeftForRedelivery)
            }
        }
    }

    async fn fail(&self, job_id: &str, message: String) -> Result<ImportJob, ImportError> {
        self.jobs.transition(job_id, JobTransition::fail(message)).await.map_err(|e| {
            error!("Failed to mark job {} as FAILED: {}", job_id, e);
            e
        })
    }
}
