use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    options::IndexOptions,
    Client, Collection, IndexModel,
};
use tracing::{debug, error, info, warn};

use crate::domain::{
    error::ImportError,
    models::{ImportJob, JobFilter, JobPage, JobProgress, JobStatus, JobTransition, RowError},
    ports::JobStore,
};

const MAX_WRITE_ATTEMPTS: usize = 3;

pub struct MongoJobRepository {
    collection: Collection<ImportJob>,
}

impl MongoJobRepository {
    pub fn new(client: &Client, database: &str) -> Self {
        debug!("Initializing MongoDB job repository for database: {}", database);
        let collection = client.database(database).collection("import_jobs");
        Self { collection }
    }

    pub async fn ensure_indexes(&self) -> Result<(), ImportError> {
        let by_id = IndexModel::builder()
            .keys(doc! { "id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let by_owner_status = IndexModel::builder()
            .keys(doc! { "owner": 1, "status": 1 })
            .build();
        self.collection
            .create_indexes([by_id, by_owner_status], None)
            .await
            .map_err(|e| {
                error!("Failed to create job indexes: {}", e);
                ImportError::Database(e.to_string())
            })?;
        debug!("Job indexes ensured");
        Ok(())
    }

    async fn find(&self, filter: Document) -> Result<Vec<ImportJob>, ImportError> {
        let cursor = self.collection.find(filter, None).await.map_err(|e| {
            error!("Failed to query jobs: {}", e);
            ImportError::Database(e.to_string())
        })?;
        cursor.try_collect().await.map_err(|e| {
            error!("Failed to read job cursor: {}", e);
            ImportError::Database(e.to_string())
        })
    }

    /// Read-validate-replace guarded by the stored `version`.
    async fn mutate<F>(&self, job_id: &str, change: F) -> Result<ImportJob, ImportError>
    where
        F: Fn(&mut ImportJob) -> Result<(), ImportError> + Send + Sync,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut job = self
                .get(job_id)
                .await?
                .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;
            let expected = job.version;
            change(&mut job)?;
            job.version = expected + 1;

            let result = self
                .collection
                .replace_one(doc! { "id": job_id, "version": expected as i64 }, &job, None)
                .await
                .map_err(|e| {
                    error!("Failed to update job {}: {}", job_id, e);
                    ImportError::Database(e.to_string())
                })?;
            if result.matched_count == 1 {
                return Ok(job);
            }
            warn!("Version conflict on job {} (attempt {}/{})", job_id, attempt, MAX_WRITE_ATTEMPTS);
        }
        Err(ImportError::ConcurrentModification(job_id.to_string()))
    }
}

#[async_trait]
impl JobStore for MongoJobRepository {
    async fn create(&self, mut job: ImportJob) -> Result<ImportJob, ImportError> {
        job.version = 1;
        self.collection.insert_one(&job, None).await.map_err(|e| {
            error!("Failed to create job {}: {}", job.id, e);
            ImportError::Database(e.to_string())
        })?;
        info!("Created job {} in MongoDB", job.id);
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<ImportJob>, ImportError> {
        self.collection
            .find_one(doc! { "id": job_id }, None)
            .await
            .map_err(|e| {
                error!("Failed to read job {}: {}", job_id, e);
                ImportError::Database(e.to_string())
            })
    }

    async fn transition(&self, job_id: &str, transition: JobTransition) -> Result<ImportJob, ImportError> {
        debug!("Transitioning job {} to {}", job_id, transition.target());
        self.mutate(job_id, |job| job.apply(transition.clone(), Utc::now())).await
    }

    async fn update_progress(&self, job_id: &str, progress: JobProgress) -> Result<ImportJob, ImportError> {
        self.mutate(job_id, |job| job.record_progress(progress, Utc::now())).await
    }

    async fn append_error(&self, job_id: &str, error: RowError, cap: usize) -> Result<ImportJob, ImportError> {
        self.mutate(job_id, |job| job.push_error(error.clone(), cap, Utc::now())).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage, ImportError> {
        let mut query = Document::new();
        if let Some(owner) = &filter.owner {
            query.insert("owner", owner.as_str());
        }
        if let Some(status) = filter.status {
            query.insert("status", status.as_str());
        }
        let jobs = self.find(query).await?;
        Ok(JobPage::paginate(jobs, filter))
    }

    async fn list_stale(&self, inactive_since: DateTime<Utc>) -> Result<Vec<ImportJob>, ImportError> {
        let jobs = self
            .find(doc! { "status": JobStatus::Processing.as_str() })
            .await?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.last_activity() < inactive_since)
            .collect())
    }
}
