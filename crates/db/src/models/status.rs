//! Job lifecycle status and its forward-only transition graph.
//!
//! ```text
//! Waiting -> Requested -> Queued <-> Processing -> Done
//!                |          |            |
//!                +----------+------------+------> Error
//! ```
//!
//! Nothing returns to `Waiting` or `Requested`; a retry creates a new job.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Requested,
    Queued,
    Processing,
    Done,
    Error,
}

impl JobStatus {
    /// Statuses counted against the concurrency cap.
    pub const ACTIVE: [JobStatus; 3] = [Self::Requested, Self::Queued, Self::Processing];

    /// Statuses the poller checks on the remote cluster.
    pub const PENDING: [JobStatus; 2] = [Self::Queued, Self::Processing];

    pub const TERMINAL: [JobStatus; 2] = [Self::Done, Self::Error];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether the lifecycle graph has an edge from `self` to `next`.
    ///
    /// Restating the current status is always allowed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Waiting, Requested)
                | (Requested, Queued | Processing | Error)
                | (Queued, Processing | Done | Error)
                | (Processing, Queued | Done | Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Requested => "requested",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
