//! Entry points that add and remove jobs.

use std::sync::Arc;

use chrono::Utc;
use pixelq_core::error::CoreError;
use pixelq_core::params::GenerationParams;
use pixelq_core::types::{new_job_id, JobId};
use pixelq_db::models::job::JobRecord;
use pixelq_db::models::status::JobStatus;
use pixelq_db::repositories::ParamsRepo;

use crate::store::{JobRecordStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for IntakeError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

pub struct JobIntake {
    store: Arc<JobRecordStore>,
}

impl JobIntake {
    pub fn new(store: Arc<JobRecordStore>) -> Self {
        Self { store }
    }

    /// Validate `params` and add a new `Waiting` job for them.
    pub async fn create_job(&self, params: GenerationParams) -> Result<JobRecord, IntakeError> {
        params.validate()?;

        let job = JobRecord::waiting(new_job_id(), params.num_images, Utc::now());
        ParamsRepo::insert(self.store.pool(), job.id, &params).await?;
        let job = self.store.insert(job).await?;

        tracing::info!(job_id = %job.id, images = params.num_images, "Job created");
        Ok(job)
    }

    /// Recreate a finished or failed job from its stored parameters.
    ///
    /// The old job is deleted; the replacement starts in `Waiting`.
    pub async fn retry_job(&self, id: JobId) -> Result<JobRecord, IntakeError> {
        let old = self.store.get(id).ok_or(CoreError::JobNotFound(id))?;
        if !old.status.is_terminal() {
            let message = format!("job {id} is {} and cannot be retried", old.status);
            return Err(CoreError::Conflict(message).into());
        }

        let params = ParamsRepo::find(self.store.pool(), id)
            .await?
            .ok_or(CoreError::JobNotFound(id))?;

        let job = self.create_job(params).await?;
        self.store.delete(id);
        tracing::info!(old_job_id = %id, job_id = %job.id, "Job retried");
        Ok(job)
    }

    /// Remove a job in any status. Returns `false` if it was unknown.
    ///
    /// Work already in flight for the job finishes, but its results are
    /// discarded.
    pub fn delete_job(&self, id: JobId) -> bool {
        self.store.delete(id).is_some()
    }

    /// Delete every `Done` or `Error` job. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        self.store
            .get_by_status(&JobStatus::TERMINAL)
            .into_iter()
            .filter(|job| self.store.delete(job.id).is_some())
            .count()
    }
}
