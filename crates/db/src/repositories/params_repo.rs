//! Repository for the `generation_params` table (intake side).

use chrono::Utc;
use pixelq_core::params::GenerationParams;
use pixelq_core::types::JobId;
use sqlx::types::Json;
use sqlx::SqliteExecutor;

use crate::DbPool;

/// Stores the original generation parameters of each job.
pub struct ParamsRepo;

impl ParamsRepo {
    pub async fn insert<'e, E>(
        executor: E,
        job_id: JobId,
        params: &GenerationParams,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            "INSERT INTO generation_params (job_id, params, created_at) VALUES ($1, $2, $3)",
        )
        .bind(job_id)
        .bind(Json(params))
        .bind(Utc::now())
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn find(
        pool: &DbPool,
        job_id: JobId,
    ) -> Result<Option<GenerationParams>, sqlx::Error> {
        let row: Option<Json<GenerationParams>> =
            sqlx::query_scalar("SELECT params FROM generation_params WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(pool)
                .await?;
        Ok(row.map(|Json(params)| params))
    }

    pub async fn delete<'e, E>(executor: E, job_id: JobId) -> Result<bool, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query("DELETE FROM generation_params WHERE job_id = $1")
            .bind(job_id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
