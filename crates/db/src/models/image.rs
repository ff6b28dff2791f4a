//! Downloaded image rows and their attribution metadata.

use pixelq_core::types::{JobId, Timestamp};
use sqlx::FromRow;

/// A row from the `images` table.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ImageRecord {
    /// Remote generation id; unique across all jobs.
    pub generation_id: String,
    pub job_id: JobId,
    pub data: Vec<u8>,
    pub model: Option<String>,
    pub seed: Option<String>,
    pub worker_id: Option<String>,
    pub worker_name: Option<String>,
    /// This image's share of the job's reward.
    pub kudos: f64,
    #[sqlx(json)]
    pub gen_metadata: serde_json::Value,
    pub created_at: Timestamp,
}
