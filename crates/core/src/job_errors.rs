//! Error taxonomy recorded on job records.
//!
//! Job-level errors are data, not Rust errors: they accumulate on the job's
//! `errors` list and are surfaced to the user next to the job. Transient
//! conditions (rate limiting, a single failed poll) are never recorded here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Message attached when the remote cluster reports it cannot currently
/// fulfil a job.
pub const NO_WORKERS_MESSAGE: &str = "No workers are currently available to fulfil this request. \
     The job stays queued and will start once capacity frees up.";

/// Message recorded when the remote cluster no longer recognises a job.
pub const NOT_FOUND_MESSAGE: &str = "Job has expired or was not found on the remote cluster.";

/// Classification of a job-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The remote API rejected the submission with a structured error.
    SubmissionRejected,
    /// The submission response was null or malformed.
    UnknownSubmissionFailure,
    /// The remote cluster no longer recognises the job.
    NotFound,
    /// The remote API throttled us. Never fatal to a job.
    RateLimited,
    /// An image was withheld because the job disallows NSFW content.
    NsfwBlocked,
    /// A remote worker failed to produce an image.
    RemoteWorkerFailure,
    /// Unexpected failure inside the dispatch, poll or download path.
    LocalException,
    /// Advisory: no worker can currently take the job.
    NoAvailableWorkers,
}

/// One entry of a job's `errors` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: None,
            message: message.into(),
        }
    }

    pub fn for_field(
        kind: ErrorKind,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn local(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LocalException, message)
    }

    pub fn no_workers() -> Self {
        Self::new(ErrorKind::NoAvailableWorkers, NO_WORKERS_MESSAGE)
    }

    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound, NOT_FOUND_MESSAGE)
    }
}

/// Turn a structured submission rejection into taxonomy entries.
///
/// One `submission_rejected` entry is produced per offending field. When a
/// top-level message accompanies field errors it is added as a trailing
/// summary entry; with no field errors the message alone is recorded.
pub fn submission_rejection(
    message: Option<&str>,
    field_errors: &BTreeMap<String, String>,
) -> Vec<JobError> {
    let mut errors: Vec<JobError> = field_errors
        .iter()
        .map(|(field, msg)| JobError::for_field(ErrorKind::SubmissionRejected, field, msg))
        .collect();

    match message.map(str::trim).filter(|m| !m.is_empty()) {
        Some(msg) => errors.push(JobError::new(ErrorKind::SubmissionRejected, msg)),
        None if errors.is_empty() => errors.push(JobError::new(
            ErrorKind::SubmissionRejected,
            "The remote API rejected the request without a reason.",
        )),
        None => {}
    }

    errors
}

/// Entry recorded when the submission response could not be understood.
pub fn unknown_submission_failure(detail: impl std::fmt::Display) -> JobError {
    JobError::new(
        ErrorKind::UnknownSubmissionFailure,
        format!("Unable to submit the request to the remote cluster: {detail}"),
    )
}
