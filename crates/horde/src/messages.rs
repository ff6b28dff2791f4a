//! Remote API message types.
//!
//! Every response field carries a serde default: the remote cluster omits
//! fields freely, and a missing counter is read as zero rather than as a
//! malformed response.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Body of a `202 Accepted` response to a submission.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmitResponse {
    /// Remote job identifier used for all later calls.
    pub id: String,
    #[serde(default)]
    pub kudos: f64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub warnings: Vec<serde_json::Value>,
}

/// Error envelope returned by the remote API on non-2xx responses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub message: Option<String>,
    /// Machine-readable return code, e.g. `KudosUpfront`.
    #[serde(default)]
    pub rc: Option<String>,
    #[serde(default)]
    pub errors: Option<BTreeMap<String, serde_json::Value>>,
}

impl ErrorResponse {
    /// Per-field validation errors as plain strings.
    pub fn field_errors(&self) -> BTreeMap<String, String> {
        self.errors
            .iter()
            .flatten()
            .map(|(field, value)| {
                let message = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (field.clone(), message)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.message.as_deref().map_or(true, |m| m.trim().is_empty())
            && self.errors.as_ref().map_or(true, |e| e.is_empty())
    }
}

/// Result of a submission call that reached the remote API.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted(SubmitResponse),
    /// The remote API refused the job with a structured error.
    Rejected { status: u16, error: ErrorResponse },
}

/// Lightweight status of a remote job (`GET /v2/generate/check/{id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    #[serde(default)]
    pub finished: i64,
    #[serde(default)]
    pub processing: i64,
    #[serde(default)]
    pub restarted: i64,
    #[serde(default)]
    pub waiting: i64,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub faulted: bool,
    /// Estimated seconds until completion.
    #[serde(default)]
    pub wait_time: i64,
    #[serde(default)]
    pub queue_position: i64,
    #[serde(default)]
    pub kudos: f64,
    #[serde(default = "default_true")]
    pub is_possible: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CheckResponse {
    fn default() -> Self {
        Self {
            finished: 0,
            processing: 0,
            restarted: 0,
            waiting: 0,
            done: false,
            faulted: false,
            wait_time: 0,
            queue_position: 0,
            kudos: 0.0,
            is_possible: true,
        }
    }
}

/// Full results of a remote job (`GET /v2/generate/status/{id}`).
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub generations: Vec<Generation>,
    /// Total reward charged for the job.
    #[serde(default)]
    pub kudos: f64,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub faulted: bool,
}

/// One generated image.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Generation {
    pub id: String,
    /// Download URL of the image payload.
    #[serde(rename = "img")]
    pub image_ref: String,
    #[serde(default)]
    pub seed: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub censored: bool,
    #[serde(default)]
    pub gen_metadata: Vec<serde_json::Value>,
}

impl Generation {
    /// Censored or otherwise withheld by the remote side.
    pub fn is_blocked(&self) -> bool {
        self.censored || matches!(self.state.as_deref(), Some("censored" | "faulted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_response_fills_missing_fields() {
        let parsed: CheckResponse =
            serde_json::from_str(r#"{"done": false, "processing": 1, "wait_time": 12}"#).unwrap();
        assert_eq!(parsed.processing, 1);
        assert_eq!(parsed.wait_time, 12);
        assert!(parsed.is_possible);
        assert_eq!(parsed.finished, 0);
    }

    #[test]
    fn generation_reads_img_as_image_ref() {
        let parsed: Generation = serde_json::from_value(serde_json::json!({
            "id": "gen-1",
            "img": "https://r2.example/gen-1.webp",
            "seed": "99",
            "censored": true,
            "worker_id": "w",
            "model": "Deliberate"
        }))
        .unwrap();
        assert_eq!(parsed.image_ref, "https://r2.example/gen-1.webp");
        assert!(parsed.is_blocked());
    }

    #[test]
    fn error_response_stringifies_field_errors() {
        let parsed: ErrorResponse = serde_json::from_value(serde_json::json!({
            "message": "Input payload validation failed",
            "errors": {"params.steps": "too many", "params.n": 50}
        }))
        .unwrap();
        let fields = parsed.field_errors();
        assert_eq!(fields["params.steps"], "too many");
        assert_eq!(fields["params.n"], "50");
        assert!(!parsed.is_empty());
    }

    #[test]
    fn empty_error_response() {
        let parsed: ErrorResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.is_empty());
    }
}
