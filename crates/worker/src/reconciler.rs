//! Turns remote results into stored images and final job counters.
//!
//! Reconciliation is idempotent: generations already in storage are
//! skipped, and the images and the updated job record are written in a
//! single transaction.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use pixelq_core::job_errors::{ErrorKind, JobError};
use pixelq_core::rate_limit::RateLimiter;
use pixelq_core::types::JobId;
use pixelq_db::models::image::ImageRecord;
use pixelq_db::models::job::JobPatch;
use pixelq_db::models::status::JobStatus;
use pixelq_db::repositories::{ImageRepo, ParamsRepo};
use pixelq_horde::messages::{CheckResponse, Generation};
use pixelq_horde::{GenerationApi, HordeApiError};

use crate::store::{JobRecordStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Remote API error: {0}")]
    Remote(#[from] HordeApiError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for ReconcileError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

/// Whether the remote job has finished as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Some images finished; the job keeps running.
    Partial,
    /// The remote job is done; counters and status become final.
    Terminal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub downloaded: usize,
    /// Generations already in storage.
    pub already_stored: usize,
    pub blocked: usize,
    pub download_failures: usize,
}

pub struct CompletionReconciler {
    store: Arc<JobRecordStore>,
    api: Arc<dyn GenerationApi>,
    status_limiter: Arc<RateLimiter>,
}

impl CompletionReconciler {
    pub fn new(
        store: Arc<JobRecordStore>,
        api: Arc<dyn GenerationApi>,
        status_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            store,
            api,
            status_limiter,
        }
    }

    /// Fetch the results of a remote job and store what is new.
    ///
    /// Returns `None` when the job is gone or has no remote id.
    pub async fn reconcile(
        &self,
        job_id: JobId,
        mode: ReconcileMode,
        check: &CheckResponse,
    ) -> Result<Option<ReconcileOutcome>, ReconcileError> {
        let Some(job) = self.store.get(job_id) else {
            return Ok(None);
        };
        let Some(remote_id) = job.remote_id.clone() else {
            return Ok(None);
        };
        let pool = self.store.pool();

        let nsfw_allowed = ParamsRepo::find(pool, job_id)
            .await?
            .is_some_and(|params| params.nsfw);

        self.status_limiter.wait_for_slot().await;
        let results = self.api.fetch_results(&remote_id).await?;

        let mut outcome = ReconcileOutcome::default();
        let mut errors = Vec::new();
        let mut to_download: Vec<&Generation> = Vec::new();

        for generation in &results.generations {
            if generation.is_blocked() {
                outcome.blocked += 1;
                let error = blocked_error(generation, nsfw_allowed);
                // Recorded once per generation across partial passes.
                if !job.errors.contains(&error) {
                    errors.push(error);
                }
            } else if ImageRepo::exists(pool, &generation.id).await? {
                outcome.already_stored += 1;
            } else {
                to_download.push(generation);
            }
        }

        let clean = results.generations.len() - outcome.blocked;
        let kudos_each = if clean > 0 {
            results.kudos / clean as f64
        } else {
            0.0
        };

        let downloads = join_all(to_download.into_iter().map(|generation| async move {
            let fetched = self.api.download_image(&generation.image_ref).await;
            (generation, fetched)
        }))
        .await;

        let now = Utc::now();
        let mut images = Vec::new();
        let mut download_errors = Vec::new();
        for (generation, fetched) in downloads {
            match fetched {
                Ok(data) => images.push(ImageRecord {
                    generation_id: generation.id.clone(),
                    job_id,
                    data,
                    model: generation.model.clone(),
                    seed: generation.seed.clone(),
                    worker_id: generation.worker_id.clone(),
                    worker_name: generation.worker_name.clone(),
                    kudos: kudos_each,
                    gen_metadata: serde_json::Value::Array(generation.gen_metadata.clone()),
                    created_at: now,
                }),
                Err(e) => {
                    tracing::warn!(
                        job_id = %job_id,
                        generation_id = %generation.id,
                        error = %e,
                        "Image download failed",
                    );
                    outcome.download_failures += 1;
                    download_errors.push(JobError::local(format!("Image download failed: {e}")));
                }
            }
        }
        outcome.downloaded = images.len();

        let completed = (outcome.already_stored + outcome.downloaded) as i64;
        // Blocked generations are final even mid-job; failed downloads are
        // retried on the next partial pass.
        let mut patch = JobPatch {
            images_completed: Some(completed),
            images_failed: Some(outcome.blocked as i64),
            wait_time: Some(check.wait_time),
            queue_position: Some(check.queue_position),
            is_possible: Some(check.is_possible),
            api_response: serde_json::to_value(check).ok(),
            ..Default::default()
        };

        if mode == ReconcileMode::Terminal {
            let failed = (outcome.blocked + outcome.download_failures) as i64;
            patch.images_failed = Some(failed);
            errors.append(&mut download_errors);
            if completed == 0 {
                if failed == 0 {
                    errors.push(JobError::new(
                        ErrorKind::RemoteWorkerFailure,
                        "The remote cluster returned no images for this job.",
                    ));
                }
                patch.status = Some(JobStatus::Error);
            } else {
                patch.status = Some(JobStatus::Done);
            }
        }
        patch.errors = errors;

        let Some((job, inserted)) = self.store.commit_images(job_id, &images, &patch).await? else {
            tracing::debug!(
                job_id = %job_id,
                "Job deleted during reconciliation, results discarded",
            );
            return Ok(None);
        };

        tracing::info!(
            job_id = %job_id,
            mode = ?mode,
            inserted,
            images_completed = job.images_completed,
            images_failed = job.images_failed,
            status = %job.status,
            "Results reconciled",
        );
        Ok(Some(outcome))
    }
}

fn blocked_error(generation: &Generation, nsfw_allowed: bool) -> JobError {
    if nsfw_allowed {
        JobError::new(
            ErrorKind::RemoteWorkerFailure,
            format!("Image {} was withheld by the remote worker.", generation.id),
        )
    } else {
        JobError::new(
            ErrorKind::NsfwBlocked,
            format!(
                "Image {} was blocked because it may contain NSFW content.",
                generation.id
            ),
        )
    }
}
