//! Tracks `Queued` and `Processing` jobs on the remote cluster.
//!
//! A tick checks every pending job (minus ones checked moments ago),
//! applies the results in order, and hands finished work to the
//! [`CompletionReconciler`] through the serial [`TaskQueue`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pixelq_core::job_errors::{ErrorKind, JobError};
use pixelq_core::rate_limit::RateLimiter;
use pixelq_db::models::job::{JobPatch, JobRecord};
use pixelq_db::models::status::JobStatus;
use pixelq_db::repositories::ImageRepo;
use pixelq_horde::messages::CheckResponse;
use pixelq_horde::{GenerationApi, HordeApiError};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::reconciler::{CompletionReconciler, ReconcileMode};
use crate::store::{JobRecordStore, StoreError};
use crate::task_queue::TaskQueue;

/// Timing knobs of the poller.
#[derive(Debug, Clone, Copy)]
pub struct PollTimings {
    pub min_interval: Duration,
    pub dedup_ttl: Duration,
    pub rate_limit_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The previous tick is still running.
    InProgress,
    /// The remote API answered 429 recently.
    Backoff,
    /// The previous tick finished less than the minimum interval ago.
    TooSoon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTick {
    Skipped(SkipReason),
    NoPendingJobs,
    Polled(PollSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    /// Jobs left out because they were checked within the dedup window.
    pub deduplicated: usize,
    pub updated: usize,
    pub reconciled: usize,
    pub failed: usize,
    pub rate_limited: bool,
}

#[derive(Debug, Default)]
struct Schedule {
    last_finished: Option<Instant>,
    next_allowed: Option<Instant>,
}

pub struct PendingPoller {
    store: Arc<JobRecordStore>,
    api: Arc<dyn GenerationApi>,
    status_limiter: Arc<RateLimiter>,
    queue: Arc<TaskQueue>,
    reconciler: Arc<CompletionReconciler>,
    timings: PollTimings,
    checking: AtomicBool,
    schedule: Mutex<Schedule>,
    /// Remote ids checked recently, with the time of the check.
    recent: Mutex<HashMap<String, Instant>>,
}

/// Clears the in-progress flag when a tick ends.
struct CheckingGuard<'a>(&'a AtomicBool);

impl Drop for CheckingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PendingPoller {
    pub fn new(
        store: Arc<JobRecordStore>,
        api: Arc<dyn GenerationApi>,
        status_limiter: Arc<RateLimiter>,
        queue: Arc<TaskQueue>,
        reconciler: Arc<CompletionReconciler>,
        timings: PollTimings,
    ) -> Self {
        Self {
            store,
            api,
            status_limiter,
            queue,
            reconciler,
            timings,
            checking: AtomicBool::new(false),
            schedule: Mutex::new(Schedule::default()),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Check all pending jobs once.
    pub async fn tick(self: &Arc<Self>) -> PollTick {
        if self.checking.swap(true, Ordering::AcqRel) {
            return PollTick::Skipped(SkipReason::InProgress);
        }
        let _guard = CheckingGuard(&self.checking);

        let now = Instant::now();
        {
            let schedule = self.schedule();
            if schedule.next_allowed.is_some_and(|at| now < at) {
                return PollTick::Skipped(SkipReason::Backoff);
            }
            if schedule
                .last_finished
                .is_some_and(|at| now.duration_since(at) < self.timings.min_interval)
            {
                return PollTick::Skipped(SkipReason::TooSoon);
            }
        }

        let pending = self.store.get_by_status(&JobStatus::PENDING);
        if pending.is_empty() {
            self.schedule().last_finished = None;
            return PollTick::NoPendingJobs;
        }

        let mut summary = PollSummary::default();
        let batch = self.select_batch(pending, now, &mut summary);

        let mut checks = JoinSet::new();
        for (index, (job, remote_id)) in batch.into_iter().enumerate() {
            let api = Arc::clone(&self.api);
            let limiter = Arc::clone(&self.status_limiter);
            checks.spawn(async move {
                limiter.wait_for_slot().await;
                let result = api.check_status(&remote_id).await;
                (index, job, result)
            });
        }

        let mut results = Vec::with_capacity(checks.len());
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Status check task panicked"),
            }
        }
        // Apply in batch order, oldest job first.
        results.sort_by_key(|(index, _, _)| *index);
        summary.checked = results.len();

        let mut reconciliations = JoinSet::new();
        for (_, job, result) in results {
            match result {
                Err(HordeApiError::RateLimited) => {
                    let until = Instant::now() + self.timings.rate_limit_backoff;
                    self.schedule().next_allowed = Some(until);
                    summary.rate_limited = true;
                    tracing::warn!(
                        backoff_ms = self.timings.rate_limit_backoff.as_millis() as u64,
                        "Remote API rate limit hit, pausing status checks",
                    );
                    break;
                }
                Err(HordeApiError::NotFound) => match self.handle_not_found(&job).await {
                    Ok(()) => summary.updated += 1,
                    Err(e) => {
                        tracing::error!(
                            job_id = %job.id,
                            error = %e,
                            "Failed to settle missing job",
                        )
                    }
                },
                Err(e) if e.is_timeout() => {
                    tracing::warn!(job_id = %job.id, "Status check timed out, retrying next tick");
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        error = %e,
                        "Status check failed, retrying next tick",
                    );
                }
                Ok(check) => {
                    if check.faulted {
                        summary.failed += 1;
                        let patch = JobPatch::failed(JobError::new(
                            ErrorKind::RemoteWorkerFailure,
                            "The remote cluster reported the job as faulted.",
                        ));
                        self.merge(&job, &patch).await;
                    } else if let Some(mode) = completion_mode(&job, &check) {
                        summary.reconciled += 1;
                        self.spawn_reconcile(&mut reconciliations, &job, mode, check);
                    } else {
                        summary.updated += 1;
                        self.merge(&job, &progress_patch(&job, &check)).await;
                    }
                }
            }
        }

        while let Some(joined) = reconciliations.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Reconciliation task panicked");
            }
        }

        self.schedule().last_finished = Some(Instant::now());
        PollTick::Polled(summary)
    }

    // ---- private helpers ----

    /// Drop jobs checked within the dedup window and mark the rest.
    fn select_batch(
        &self,
        pending: Vec<JobRecord>,
        now: Instant,
        summary: &mut PollSummary,
    ) -> Vec<(JobRecord, String)> {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.retain(|_, at| now.duration_since(*at) < self.timings.dedup_ttl);

        let mut batch = Vec::with_capacity(pending.len());
        for job in pending {
            let Some(remote_id) = job.remote_id.clone() else {
                tracing::warn!(
                    job_id = %job.id,
                    status = %job.status,
                    "Pending job has no remote id",
                );
                continue;
            };
            if recent.contains_key(&remote_id) {
                summary.deduplicated += 1;
                continue;
            }
            if !self.timings.dedup_ttl.is_zero() {
                recent.insert(remote_id.clone(), now);
            }
            batch.push((job, remote_id));
        }
        batch
    }

    /// The remote cluster forgot the job: keep what was downloaded, if any.
    async fn handle_not_found(&self, job: &JobRecord) -> Result<(), StoreError> {
        let stored = ImageRepo::count_for_job(self.store.pool(), job.id).await?;
        let patch = if stored == 0 {
            JobPatch::failed(JobError::not_found())
        } else {
            JobPatch {
                status: Some(JobStatus::Done),
                images_completed: Some(stored),
                ..Default::default()
            }
        };
        tracing::info!(job_id = %job.id, stored, "Remote job not found");
        self.store.upsert_merge(job.id, &patch).await?;
        Ok(())
    }

    fn spawn_reconcile(
        &self,
        set: &mut JoinSet<()>,
        job: &JobRecord,
        mode: ReconcileMode,
        check: CheckResponse,
    ) {
        let queue = Arc::clone(&self.queue);
        let reconciler = Arc::clone(&self.reconciler);
        let job_id = job.id;

        set.spawn(async move {
            let queued = queue
                .enqueue(job_id, async { reconciler.reconcile(job_id, mode, &check).await })
                .await;
            match queued {
                Ok(None) | Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    tracing::warn!(
                        job_id = %job_id,
                        error = %e,
                        "Reconciliation failed, retrying next tick",
                    )
                }
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Reconciliation abandoned"),
            }
        });
    }

    async fn merge(&self, job: &JobRecord, patch: &JobPatch) {
        if let Err(e) = self.store.upsert_merge(job.id, patch).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to record status");
        }
    }

    fn schedule(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether a check means there are results to collect.
fn completion_mode(job: &JobRecord, check: &CheckResponse) -> Option<ReconcileMode> {
    if check.done {
        Some(ReconcileMode::Terminal)
    } else if check.finished > job.images_completed + job.images_failed {
        Some(ReconcileMode::Partial)
    } else {
        None
    }
}

/// Progress update for a job that is still running remotely.
fn progress_patch(job: &JobRecord, check: &CheckResponse) -> JobPatch {
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
    if !check.is_possible && !job.has_error(ErrorKind::NoAvailableWorkers) {
        patch.errors.push(JobError::no_workers());
    }
    patch
}
