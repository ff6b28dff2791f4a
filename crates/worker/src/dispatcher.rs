//! Moves `Waiting` jobs onto the remote cluster.
//!
//! Each tick fills the free concurrency slots with the oldest waiting jobs.
//! A job is claimed (`Waiting -> Requested`) before anything is sent, so
//! overlapping ticks never submit the same job twice.

use std::sync::Arc;
use std::time::Duration;

use pixelq_core::job_errors::{self, JobError};
use pixelq_core::rate_limit::RateLimiter;
use pixelq_core::types::JobId;
use pixelq_db::models::job::{JobPatch, JobRecord};
use pixelq_db::models::status::JobStatus;
use pixelq_db::repositories::ParamsRepo;
use pixelq_horde::messages::{CheckResponse, SubmitOutcome};
use pixelq_horde::payload::GenerationPayload;
use pixelq_horde::{GenerationApi, HordeApiError};
use tokio::task::JoinSet;

use crate::store::{JobRecordStore, StoreError};

/// Result of one dispatcher tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTick {
    /// Every concurrency slot is taken.
    AtCapacity,
    NoWaitingJobs,
    Dispatched(DispatchSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Jobs this tick claimed.
    pub claimed: usize,
    /// Claimed jobs now known to the remote cluster.
    pub submitted: usize,
    /// Claimed jobs that ended in `Error`.
    pub failed: usize,
}

/// What happened to a single waiting job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobDispatch {
    /// Another tick claimed it first, or it was deleted.
    Skipped,
    Submitted,
    Failed,
}

pub struct WaitingDispatcher {
    store: Arc<JobRecordStore>,
    api: Arc<dyn GenerationApi>,
    submit_limiter: Arc<RateLimiter>,
    status_limiter: Arc<RateLimiter>,
    max_concurrent_jobs: usize,
    settle_delay: Duration,
}

impl WaitingDispatcher {
    pub fn new(
        store: Arc<JobRecordStore>,
        api: Arc<dyn GenerationApi>,
        submit_limiter: Arc<RateLimiter>,
        status_limiter: Arc<RateLimiter>,
        max_concurrent_jobs: usize,
        settle_delay: Duration,
    ) -> Self {
        Self {
            store,
            api,
            submit_limiter,
            status_limiter,
            max_concurrent_jobs,
            settle_delay,
        }
    }

    /// Claim and submit as many waiting jobs as there are free slots.
    pub async fn tick(self: &Arc<Self>) -> DispatchTick {
        let active = self.store.count_by_status(&JobStatus::ACTIVE);
        if active >= self.max_concurrent_jobs {
            return DispatchTick::AtCapacity;
        }

        let free = self.max_concurrent_jobs - active;
        let waiting: Vec<JobRecord> = self
            .store
            .get_by_status(&[JobStatus::Waiting])
            .into_iter()
            .take(free)
            .collect();
        if waiting.is_empty() {
            return DispatchTick::NoWaitingJobs;
        }

        tracing::debug!(active, free, batch = waiting.len(), "Dispatching waiting jobs");

        let mut set = JoinSet::new();
        for job in waiting {
            let this = Arc::clone(self);
            set.spawn(async move { this.dispatch_job(job.id).await });
        }

        let mut summary = DispatchSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(JobDispatch::Skipped) => {}
                Ok(JobDispatch::Submitted) => {
                    summary.claimed += 1;
                    summary.submitted += 1;
                }
                Ok(JobDispatch::Failed) => {
                    summary.claimed += 1;
                    summary.failed += 1;
                }
                Err(e) => tracing::error!(error = %e, "Dispatch task panicked"),
            }
        }

        DispatchTick::Dispatched(summary)
    }

    /// Claim one job and drive it through submission and its first check.
    async fn dispatch_job(&self, job_id: JobId) -> JobDispatch {
        let claimed = match self
            .store
            .claim_transition(job_id, JobStatus::Waiting, JobStatus::Requested)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => return JobDispatch::Skipped,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to claim job");
                return JobDispatch::Skipped;
            }
        };

        match self.submit_claimed(&claimed).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Dispatch failed");
                self.fail(job_id, vec![JobError::local(e.to_string())]).await;
                JobDispatch::Failed
            }
        }
    }

    async fn submit_claimed(&self, job: &JobRecord) -> Result<JobDispatch, StoreError> {
        let Some(params) = ParamsRepo::find(self.store.pool(), job.id).await? else {
            tracing::warn!(job_id = %job.id, "No generation parameters stored for job");
            self.fail(job.id, vec![JobError::local("Generation parameters are missing")])
                .await;
            return Ok(JobDispatch::Failed);
        };

        let payload = GenerationPayload::from(&params);

        self.submit_limiter.wait_for_slot().await;
        let accepted = match self.api.submit(&payload).await {
            Ok(SubmitOutcome::Accepted(accepted)) => accepted,
            Ok(SubmitOutcome::Rejected { status, error }) => {
                tracing::info!(
                    job_id = %job.id,
                    status,
                    rc = error.rc.as_deref().unwrap_or(""),
                    "Submission rejected",
                );
                let errors = job_errors::submission_rejection(
                    error.message.as_deref(),
                    &error.field_errors(),
                );
                self.fail(job.id, errors).await;
                return Ok(JobDispatch::Failed);
            }
            Err(HordeApiError::Malformed(detail)) => {
                tracing::warn!(
                    job_id = %job.id,
                    detail = %detail,
                    "Unreadable submission response",
                );
                self.fail(job.id, vec![job_errors::unknown_submission_failure(detail)])
                    .await;
                return Ok(JobDispatch::Failed);
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Submission failed");
                self.fail(job.id, vec![JobError::local(e.to_string())]).await;
                return Ok(JobDispatch::Failed);
            }
        };

        let remote_id = accepted.id;
        tracing::info!(job_id = %job.id, remote_id = %remote_id, "Job submitted");

        let recorded = self
            .store
            .upsert_merge(
                job.id,
                &JobPatch {
                    remote_id: Some(remote_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        if recorded.is_none() {
            tracing::debug!(job_id = %job.id, "Job deleted after submission");
            return Ok(JobDispatch::Skipped);
        }

        tokio::time::sleep(self.settle_delay).await;

        self.status_limiter.wait_for_slot().await;
        let patch = match self.api.check_status(&remote_id).await {
            Ok(check) => initial_patch(&check),
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    remote_id = %remote_id,
                    error = %e,
                    "Initial status check failed, leaving job queued",
                );
                JobPatch::status(JobStatus::Queued)
            }
        };

        match self
            .store
            .claim_transition_with(job.id, JobStatus::Requested, patch)
            .await?
        {
            Some(job) => {
                tracing::debug!(job_id = %job.id, status = %job.status, "Initial status recorded");
                Ok(JobDispatch::Submitted)
            }
            None => Ok(JobDispatch::Skipped),
        }
    }

    /// Move a claimed job to `Error`. Storage failures here are only logged.
    async fn fail(&self, job_id: JobId, errors: Vec<JobError>) {
        let patch = JobPatch::status(JobStatus::Error).with_errors(errors);
        if let Err(e) = self.store.upsert_merge(job_id, &patch).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
        }
    }
}

/// Patch for the first status snapshot after submission.
fn initial_patch(check: &CheckResponse) -> JobPatch {
    let status = if check.processing >= 1 {
        JobStatus::Processing
    } else {
        JobStatus::Queued
    };

    let mut patch = JobPatch {
        status: Some(status),
        wait_time: Some(check.wait_time),
        queue_position: Some(check.queue_position),
        is_possible: Some(check.is_possible),
        api_response: serde_json::to_value(check).ok(),
        ..Default::default()
    };
    if !check.is_possible {
        patch.status = Some(JobStatus::Queued);
        patch.errors.push(JobError::no_workers());
    }
    patch
}
