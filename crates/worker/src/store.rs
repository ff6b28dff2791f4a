//! In-memory job table backed by durable storage.
//!
//! Every mutation is written to SQLite first and mirrored into memory only
//! after the write succeeds, so a crash never leaves memory ahead of disk.
//! Mutations of one job are serialized through a per-job lock; this is what
//! makes [`JobRecordStore::claim_transition`] an atomic compare-and-set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use pixelq_core::job_errors::JobError;
use pixelq_core::types::JobId;
use pixelq_db::models::image::ImageRecord;
use pixelq_db::models::job::{JobPatch, JobRecord};
use pixelq_db::models::status::JobStatus;
use pixelq_db::repositories::JobRepo;
use pixelq_db::DbPool;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Capacity of the job event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {0} already exists")]
    Duplicate(JobId),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Change notification published after a mutation became durable.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    Updated(JobRecord),
    Deleted(JobId),
}

/// The authoritative view of all jobs.
pub struct JobRecordStore {
    pool: DbPool,
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
    event_tx: broadcast::Sender<JobEvent>,
}

impl JobRecordStore {
    /// An empty store over `pool`.
    pub fn new(pool: DbPool) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pool,
            jobs: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Hydrate the store from durable storage.
    ///
    /// A job left in `Requested` by a previous run either never reached the
    /// remote cluster (no remote id: it becomes `Error`) or did (it becomes
    /// `Queued` so polling picks it up again).
    pub async fn load(pool: DbPool) -> Result<Self, StoreError> {
        let store = Self::new(pool);
        let now = Utc::now();
        let mut recovered = 0usize;

        let records = JobRepo::list_all(&store.pool).await?;
        let total = records.len();

        for mut job in records {
            if job.status == JobStatus::Requested {
                let patch = if job.remote_id.is_some() {
                    JobPatch::status(JobStatus::Queued)
                } else {
                    JobPatch::failed(JobError::local("Interrupted before submission"))
                };
                job.apply(&patch, now);
                JobRepo::upsert(&store.pool, &job).await?;
                recovered += 1;
            }
            store.write_jobs().insert(job.id, job);
        }

        tracing::info!(jobs = total, recovered, "Job store hydrated");
        Ok(store)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Subscribe to job change events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.read_jobs().get(&id).cloned()
    }

    /// Jobs whose status is one of `statuses`, oldest first.
    pub fn get_by_status(&self, statuses: &[JobStatus]) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .read_jobs()
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            a.created_timestamp
                .cmp(&b.created_timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        jobs
    }

    pub fn count_by_status(&self, statuses: &[JobStatus]) -> usize {
        self.read_jobs()
            .values()
            .filter(|job| statuses.contains(&job.status))
            .count()
    }

    /// Add a new record. Fails on an id that is already present.
    pub async fn insert(&self, job: JobRecord) -> Result<JobRecord, StoreError> {
        let lock = self.job_lock(job.id);
        let _guard = lock.lock().await;

        if self.read_jobs().contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        JobRepo::upsert(&self.pool, &job).await?;
        self.write_jobs().insert(job.id, job.clone());
        self.publish(JobEvent::Updated(job.clone()));
        Ok(job)
    }

    /// Atomically move a job from `from` to `to`.
    ///
    /// Returns `None` when the job is missing or no longer in `from`; the
    /// caller lost the race and must leave the job alone.
    pub async fn claim_transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.claim_transition_with(id, from, JobPatch::status(to)).await
    }

    /// Like [`claim_transition`](Self::claim_transition) but merges a full
    /// patch once the claim succeeds. The patch must carry the target status.
    pub async fn claim_transition_with(
        &self,
        id: JobId,
        from: JobStatus,
        patch: JobPatch,
    ) -> Result<Option<JobRecord>, StoreError> {
        let to = patch.status.unwrap_or(from);
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { id, from, to });
        }

        let lock = self.job_lock(id);
        let _guard = lock.lock().await;

        let Some(mut next) = self.get(id) else {
            return Ok(None);
        };
        if next.status != from {
            tracing::debug!(job_id = %id, expected = %from, actual = %next.status, "Claim lost");
            return Ok(None);
        }

        next.apply(&patch, Utc::now());
        JobRepo::upsert(&self.pool, &next).await?;
        Ok(self.install(next))
    }

    /// Merge `patch` into a job. Returns `None` if the job is gone.
    ///
    /// A status the lifecycle graph forbids is dropped; the other fields
    /// still merge.
    pub async fn upsert_merge(
        &self,
        id: JobId,
        patch: &JobPatch,
    ) -> Result<Option<JobRecord>, StoreError> {
        let lock = self.job_lock(id);
        let _guard = lock.lock().await;

        let Some(mut next) = self.get(id) else {
            return Ok(None);
        };
        let from = next.status;
        let outcome = next.apply(patch, Utc::now());
        if outcome.status_rejected {
            tracing::debug!(
                job_id = %id,
                from = %from,
                requested = ?patch.status,
                "Ignoring forbidden status change",
            );
        } else if outcome.status_changed {
            tracing::debug!(job_id = %id, from = %from, to = %next.status, "Job status changed");
        }

        JobRepo::upsert(&self.pool, &next).await?;
        Ok(self.install(next))
    }

    /// Persist downloaded images and merge `patch` in one transaction.
    ///
    /// Returns the updated record and the number of images inserted, or
    /// `None` if the job was deleted meanwhile.
    pub async fn commit_images(
        &self,
        id: JobId,
        images: &[ImageRecord],
        patch: &JobPatch,
    ) -> Result<Option<(JobRecord, u64)>, StoreError> {
        let lock = self.job_lock(id);
        let _guard = lock.lock().await;

        let Some(mut next) = self.get(id) else {
            return Ok(None);
        };
        next.apply(patch, Utc::now());

        let inserted = JobRepo::commit_with_images(&self.pool, &next, images).await?;
        Ok(self.install(next).map(|job| (job, inserted)))
    }

    /// Remove a job from memory at once; the durable delete runs in the
    /// background after any in-flight mutation of the job finishes.
    ///
    /// Returns the removed record, or `None` if no such job was known.
    pub fn delete(&self, id: JobId) -> Option<(JobRecord, JoinHandle<()>)> {
        let removed = self.write_jobs().remove(&id)?;
        self.publish(JobEvent::Deleted(id));

        let pool = self.pool.clone();
        let lock = self.job_lock(id);
        let handle = tokio::spawn(async move {
            let _guard = lock.lock().await;
            match JobRepo::delete_with_params(&pool, id).await {
                Ok(_) => tracing::debug!(job_id = %id, "Job deleted"),
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Durable job delete failed"),
            }
        });
        self.locks_map().remove(&id);

        Some((removed, handle))
    }

    // ---- private helpers ----

    /// Mirror a durably written record into memory, unless the job was
    /// deleted while the write was in flight.
    fn install(&self, job: JobRecord) -> Option<JobRecord> {
        {
            let mut jobs = self.write_jobs();
            let slot = jobs.get_mut(&job.id)?;
            *slot = job.clone();
        }
        self.publish(JobEvent::Updated(job.clone()));
        Some(job)
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn job_lock(&self, id: JobId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks_map().entry(id).or_default().clone()
    }

    fn locks_map(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}
