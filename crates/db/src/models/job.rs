//! Job record model and the merge rules applied to it.

use pixelq_core::job_errors::JobError;
use pixelq_core::types::{JobId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use super::status::JobStatus;

/// A row from the `jobs` table and the value held in the in-memory job table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    /// Identifier assigned by the remote cluster once it accepted the job.
    pub remote_id: Option<String>,
    pub images_requested: i64,
    pub images_completed: i64,
    pub images_failed: i64,
    pub queue_position: Option<i64>,
    /// Remote estimate in seconds.
    pub wait_time: Option<i64>,
    /// Largest non-zero `wait_time` seen so far; only ever grows.
    pub init_wait_time: Option<i64>,
    pub is_possible: bool,
    #[sqlx(json)]
    pub errors: Vec<JobError>,
    /// Last raw status snapshot, kept for diagnostics.
    #[sqlx(json)]
    pub api_response: serde_json::Value,
    pub created_timestamp: Timestamp,
    pub horde_received_timestamp: Option<Timestamp>,
    pub horde_completed_timestamp: Option<Timestamp>,
    pub updated_timestamp: Timestamp,
}

impl JobRecord {
    /// A fresh record in `Waiting`, as created by the intake side.
    pub fn waiting(id: JobId, images_requested: u32, now: Timestamp) -> Self {
        Self {
            id,
            status: JobStatus::Waiting,
            remote_id: None,
            images_requested: i64::from(images_requested),
            images_completed: 0,
            images_failed: 0,
            queue_position: None,
            wait_time: None,
            init_wait_time: None,
            is_possible: true,
            errors: Vec::new(),
            api_response: serde_json::Value::Null,
            created_timestamp: now,
            horde_received_timestamp: None,
            horde_completed_timestamp: None,
            updated_timestamp: now,
        }
    }

    /// Shallow-merge `patch` into this record.
    ///
    /// A status change is applied only along an edge of the lifecycle graph;
    /// otherwise the status is left alone while every other field still
    /// merges. The received/completed timestamps are set once, the first
    /// time the job reaches the matching state.
    pub fn apply(&mut self, patch: &JobPatch, now: Timestamp) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        if let Some(next) = patch.status {
            if self.status.can_transition_to(next) {
                outcome.status_changed = self.status != next;
                self.status = next;
            } else {
                outcome.status_rejected = true;
            }
        }

        if matches!(self.status, JobStatus::Queued | JobStatus::Processing)
            && self.horde_received_timestamp.is_none()
        {
            self.horde_received_timestamp = Some(now);
        }
        if self.status == JobStatus::Done && self.horde_completed_timestamp.is_none() {
            self.horde_completed_timestamp = Some(now);
        }

        if let Some(remote_id) = &patch.remote_id {
            self.remote_id = Some(remote_id.clone());
        }
        if let Some(position) = patch.queue_position {
            self.queue_position = Some(position.max(0));
        }
        if let Some(wait) = patch.wait_time {
            let wait = wait.max(0);
            self.wait_time = Some(wait);
            if wait > 0 && self.init_wait_time.map_or(true, |init| wait > init) {
                self.init_wait_time = Some(wait);
            }
        }
        if let Some(possible) = patch.is_possible {
            self.is_possible = possible;
        }
        if let Some(completed) = patch.images_completed {
            self.images_completed = completed.max(0);
        }
        if let Some(failed) = patch.images_failed {
            let room = (self.images_requested - self.images_completed).max(0);
            self.images_failed = failed.clamp(0, room);
        }

        if patch.reset_errors {
            self.errors.clear();
        }
        self.errors.extend(patch.errors.iter().cloned());

        if let Some(response) = &patch.api_response {
            self.api_response = response.clone();
        }

        self.updated_timestamp = now;
        outcome
    }

    /// Whether an error of this kind is already on the record.
    pub fn has_error(&self, kind: pixelq_core::job_errors::ErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

/// What [`JobRecord::apply`] did with the status field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub status_changed: bool,
    /// The patch asked for a transition the lifecycle graph forbids.
    pub status_rejected: bool,
}

/// Partial update for a job record. `None` fields are left untouched;
/// `errors` are appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub remote_id: Option<String>,
    pub images_completed: Option<i64>,
    pub images_failed: Option<i64>,
    pub queue_position: Option<i64>,
    pub wait_time: Option<i64>,
    pub is_possible: Option<bool>,
    pub errors: Vec<JobError>,
    /// Clear the error list before appending `errors`.
    pub reset_errors: bool,
    pub api_response: Option<serde_json::Value>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Move to `Error`, recording `error`.
    pub fn failed(error: JobError) -> Self {
        Self {
            status: Some(JobStatus::Error),
            errors: vec![error],
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: JobError) -> Self {
        self.errors.push(error);
        self
    }

    pub fn with_errors(mut self, errors: impl IntoIterator<Item = JobError>) -> Self {
        self.errors.extend(errors);
        self
    }
}
