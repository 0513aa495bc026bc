use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::{types::AttributeValue, Client};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::string_attr;
use crate::domain::{
    error::ImportError,
    models::{ImportJob, JobFilter, JobPage, JobProgress, JobStatus, JobTransition, RowError},
    ports::JobStore,
};

const MAX_WRITE_ATTEMPTS: usize = 3;

/// Jobs table keyed by `id`. The full job is kept as JSON in `payload`;
/// `status`, `owner`, `started_at` and `version` are duplicated as top-level
/// attributes for filtering and conditional writes.
pub struct DynamoJobRepository {
    client: Client,
    table: String,
}

impl DynamoJobRepository {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        let table = table.into();
        debug!("Initializing DynamoDB job repository for table: {}", table);
        Self { client, table }
    }

    fn to_item(job: &ImportJob) -> Result<HashMap<String, AttributeValue>, ImportError> {
        let payload = serde_json::to_string(job).map_err(|e| ImportError::Database(e.to_string()))?;
        let mut item = HashMap::new();
        item.insert("id".to_string(), AttributeValue::S(job.id.clone()));
        item.insert("status".to_string(), AttributeValue::S(job.status.as_str().to_string()));
        item.insert("owner".to_string(), AttributeValue::S(job.owner.clone()));
        item.insert("created_at".to_string(), AttributeValue::S(job.created_at.to_rfc3339()));
        if let Some(started_at) = job.started_at {
            item.insert("started_at".to_string(), AttributeValue::S(started_at.to_rfc3339()));
        }
        item.insert("version".to_string(), AttributeValue::N(job.version.to_string()));
        item.insert("payload".to_string(), AttributeValue::S(payload));
        Ok(item)
    }

    fn from_item(item: &HashMap<String, AttributeValue>) -> Result<ImportJob, ImportError> {
        let payload = string_attr(item, "payload")
            .ok_or_else(|| ImportError::Database("job item without payload".to_string()))?;
        serde_json::from_str(&payload).map_err(|e| {
            error!("Failed to deserialize job payload: {}", e);
            ImportError::Database(e.to_string())
        })
    }

    /// Writes `job` only if the stored version still equals `expected`.
    /// Returns false when another writer got there first.
    async fn put_if_version(&self, job: &ImportJob, expected: u64) -> Result<bool, ImportError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(Self::to_item(job)?))
            .condition_expression("#v = :expected")
            .expression_attribute_names("#v", "version")
            .expression_attribute_values(":expected", AttributeValue::N(expected.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map_or(false, |se| se.is_conditional_check_failed_exception()) => {
                Ok(false)
            }
            Err(e) => {
                error!("Failed to write job {}: {}", job.id, e);
                Err(ImportError::Database(e.to_string()))
            }
        }
    }

    /// Read-validate-write with optimistic locking, retried a few times.
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

            if self.put_if_version(&job, expected).await? {
                return Ok(job);
            }
            warn!("Version conflict on job {} (attempt {}/{})", job_id, attempt, MAX_WRITE_ATTEMPTS);
        }
        Err(ImportError::ConcurrentModification(job_id.to_string()))
    }

    async fn scan(
        &self,
        filter: Option<(&str, HashMap<String, String>, HashMap<String, AttributeValue>)>,
    ) -> Result<Vec<ImportJob>, ImportError> {
        let mut jobs = Vec::new();
        let mut start_key = None;
        loop {
            let mut request = self
                .client
                .scan()
                .table_name(&self.table)
                .set_exclusive_start_key(start_key.take());
            if let Some((expression, names, values)) = &filter {
                request = request
                    .filter_expression(*expression)
                    .set_expression_attribute_names(Some(names.clone()))
                    .set_expression_attribute_values(Some(values.clone()));
            }

            let response = request.send().await.map_err(|e| {
                error!("Failed to scan table {}: {}", self.table, e);
                ImportError::Database(e.to_string())
            })?;

            for item in response.items() {
                jobs.push(Self::from_item(item)?);
            }

            match response.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }
        debug!("Scanned {} jobs from {}", jobs.len(), self.table);
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for DynamoJobRepository {
    async fn create(&self, mut job: ImportJob) -> Result<ImportJob, ImportError> {
        job.version = 1;
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(Self::to_item(&job)?))
            .condition_expression("attribute_not_exists(id)")
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map_or(false, |se| se.is_conditional_check_failed_exception()) {
                    ImportError::ConcurrentModification(job.id.clone())
                } else {
                    error!("Failed to create job {}: {}", job.id, e);
                    ImportError::Database(e.to_string())
                }
            })?;
        info!("Created job {} in {}", job.id, self.table);
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<ImportJob>, ImportError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("id", AttributeValue::S(job_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to read job {}: {}", job_id, e);
                ImportError::Database(e.to_string())
            })?;
        response.item.as_ref().map(Self::from_item).transpose()
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
        let mut expressions = Vec::new();
        let mut names = HashMap::new();
        let mut values = HashMap::new();
        if let Some(owner) = &filter.owner {
            expressions.push("#o = :owner");
            names.insert("#o".to_string(), "owner".to_string());
            values.insert(":owner".to_string(), AttributeValue::S(owner.clone()));
        }
        if let Some(status) = filter.status {
            expressions.push("#s = :status");
            names.insert("#s".to_string(), "status".to_string());
            values.insert(":status".to_string(), AttributeValue::S(status.as_str().to_string()));
        }

        let expression = expressions.join(" AND ");
        let jobs = if expressions.is_empty() {
            self.scan(None).await?
        } else {
            self.scan(Some((expression.as_str(), names, values))).await?
        };
        Ok(JobPage::paginate(jobs, filter))
    }

    async fn list_stale(&self, inactive_since: DateTime<Utc>) -> Result<Vec<ImportJob>, ImportError> {
        let mut names = HashMap::new();
        names.insert("#s".to_string(), "status".to_string());
        let mut values = HashMap::new();
        values.insert(
            ":processing".to_string(),
            AttributeValue::S(JobStatus::Processing.as_str().to_string()),
        );
        let jobs = self.scan(Some(("#s = :processing", names, values))).await?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.last_activity() < inactive_since)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::StoredBlob;

    #[test]
    fn item_round_trips_and_exposes_filter_attributes() {
        let blob = StoredBlob {
            bucket: "b".into(),
            key: "imports/ana/x.csv".into(),
            file_name: "x.csv".into(),
        };
        let mut job = ImportJob::new(&blob, "ana", 5);
        job.version = 3;

        let item = DynamoJobRepository::to_item(&job).unwrap();
        assert_eq!(item["status"], AttributeValue::S("PENDING".into()));
        assert_eq!(item["owner"], AttributeValue::S("ana".into()));
        assert_eq!(item["version"], AttributeValue::N("3".into()));
        assert!(!item.contains_key("started_at"));

        let back = DynamoJobRepository::from_item(&item).unwrap();
        assert_eq!(back, job);
    }
}
