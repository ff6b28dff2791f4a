//! Serial FIFO runner for per-job result-download tasks.
//!
//! Tasks run one at a time in submission order. With duplicate prevention
//! on, a job that already has a task queued or running is not queued again.
//! Each task gets a hard timeout, and consecutive tasks are spaced apart so
//! downloads do not burst against the remote cluster.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use pixelq_core::types::JobId;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[error("Task for job {job_id} timed out after {after:?}")]
    TimedOut { job_id: JobId, after: Duration },
}

pub struct TaskQueue {
    prevent_duplicates: bool,
    task_timeout: Duration,
    spacing: Duration,
    pending: Mutex<HashSet<JobId>>,
    /// Held while a task runs; tokio's mutex hands out the lock in FIFO
    /// order. Holds the instant the previous task finished.
    runner: tokio::sync::Mutex<Option<Instant>>,
}

/// Removes a job id from the pending set when its task ends, however it ends.
struct PendingSlot<'a> {
    queue: &'a TaskQueue,
    job_id: JobId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.queue.pending_set().remove(&self.job_id);
    }
}

impl TaskQueue {
    pub fn new(prevent_duplicates: bool, task_timeout: Duration, spacing: Duration) -> Self {
        Self {
            prevent_duplicates,
            task_timeout,
            spacing,
            pending: Mutex::new(HashSet::new()),
            runner: tokio::sync::Mutex::new(None),
        }
    }

    /// Queue `task` for `job_id` and wait for it to run.
    ///
    /// Returns `Ok(None)` without running anything when a task for the same
    /// job is already queued or running and duplicates are prevented.
    pub async fn enqueue<F, T>(&self, job_id: JobId, task: F) -> Result<Option<T>, TaskQueueError>
    where
        F: Future<Output = T>,
    {
        let _slot = if self.prevent_duplicates {
            if !self.pending_set().insert(job_id) {
                tracing::debug!(job_id = %job_id, "Task already queued, skipping");
                return Ok(None);
            }
            Some(PendingSlot {
                queue: self,
                job_id,
            })
        } else {
            None
        };

        let mut last_finished = self.runner.lock().await;
        if let Some(finished) = *last_finished {
            tokio::time::sleep_until(finished + self.spacing).await;
        }

        let result = tokio::time::timeout(self.task_timeout, task).await;
        *last_finished = Some(Instant::now());

        match result {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                tracing::warn!(
                    job_id = %job_id,
                    timeout_ms = self.task_timeout.as_millis() as u64,
                    "Task timed out",
                );
                Err(TaskQueueError::TimedOut {
                    job_id,
                    after: self.task_timeout,
                })
            }
        }
    }

    /// Whether a task for `job_id` is queued or running.
    pub fn is_pending(&self, job_id: JobId) -> bool {
        self.pending_set().contains(&job_id)
    }

    fn pending_set(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pixelq_core::types::new_job_id;
    use tokio::sync::oneshot;

    use super::*;

    fn queue() -> Arc<TaskQueue> {
        Arc::new(TaskQueue::new(
            true,
            Duration::from_secs(30),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_job_is_skipped_while_pending() {
        let queue = queue();
        let job_id = new_job_id();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = tokio::spawn({
            let queue = queue.clone();
            async move {
                queue
                    .enqueue(job_id, async move {
                        let _ = release_rx.await;
                        "first"
                    })
                    .await
            }
        });
        tokio::task::yield_now().await;
        assert!(queue.is_pending(job_id));

        let second = queue.enqueue(job_id, async { "second" }).await.unwrap();
        assert_eq!(second, None);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Some("first"));
        assert!(!queue.is_pending(job_id));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_frees_the_job_slot() {
        let queue = Arc::new(TaskQueue::new(
            true,
            Duration::from_secs(30),
            Duration::ZERO,
        ));
        let job_id = new_job_id();

        let err = queue
            .enqueue(job_id, std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskQueueError::TimedOut { .. }));
        assert!(!queue.is_pending(job_id));

        let again = queue.enqueue(job_id, async { 7 }).await.unwrap();
        assert_eq!(again, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_tasks_are_spaced() {
        let queue = queue();
        let start = Instant::now();

        queue.enqueue(new_job_id(), async {}).await.unwrap();
        queue.enqueue(new_job_id(), async {}).await.unwrap();

        assert!(Instant::now() - start >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_run_in_submission_order() {
        let queue = queue();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..3 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(new_job_id(), async move {
                        order.lock().unwrap().push(n);
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
