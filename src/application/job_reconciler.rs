use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::domain::{
    error::ImportError,
    models::{ImportJob, JobTransition},
    ports::JobStore,
};

/// Fails PROCESSING jobs with no heartbeat for longer than the queue lease
/// plus grace (worker crash or lost lease). Long imports that keep writing
/// progress are left alone.
pub struct JobReconciler {
    jobs: Arc<dyn JobStore>,
    stale_after: Duration,
}

impl JobReconciler {
    pub fn new(jobs: Arc<dyn JobStore>, stale_after: Duration) -> Self {
        Self { jobs, stale_after }
    }

    /// Returns the jobs that were moved to FAILED.
    pub async fn fail_stale_jobs(&self) -> Result<Vec<ImportJob>, ImportError> {
        let now = Utc::now();
        let candidates = self.jobs.list_stale(now - self.stale_after).await?;
        debug!("Stale sweep found {} candidate job(s)", candidates.len());

        let mut failed = Vec::new();
        for job in candidates {
            if !job.is_stale(now, self.stale_after) {
                continue;
            }
            let message = format!(
                "Trabajo sin actividad: excedió el tiempo de procesamiento ({} s) sin finalizar",
                self.stale_after.num_seconds()
            );
            match self.jobs.transition(&job.id, JobTransition::fail(message)).await {
                Ok(job) => {
                    warn!("Job {} was stale in PROCESSING, marked FAILED", job.id);
                    failed.push(job);
                }
                // Another writer settled it between the scan and this update.
                Err(ImportError::InvalidTransition { .. }) | Err(ImportError::ConcurrentModification(_)) => {
                    debug!("Job {} changed during sweep, skipping", job.id);
                }
                Err(e) => return Err(e),
            }
        }

        if !failed.is_empty() {
            info!("Stale sweep failed {} job(s)", failed.len());
        }
        Ok(failed)
    }
}
