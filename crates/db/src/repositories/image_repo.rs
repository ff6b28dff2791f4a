//! Repository for the `images` table.

use pixelq_core::types::JobId;
use sqlx::types::Json;
use sqlx::SqliteExecutor;

use crate::models::image::ImageRecord;
use crate::DbPool;

const COLUMNS: &str = "\
    generation_id, job_id, data, model, seed, worker_id, worker_name, \
    kudos, gen_metadata, created_at";

/// Provides access to downloaded images.
pub struct ImageRepo;

impl ImageRepo {
    /// Insert an image unless its generation id is already stored.
    ///
    /// Returns the number of rows inserted (0 or 1).
    pub async fn insert_if_absent<'e, E>(
        executor: E,
        image: &ImageRecord,
    ) -> Result<u64, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let query = format!(
            "INSERT INTO images ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (generation_id) DO NOTHING"
        );
        let result = sqlx::query(&query)
            .bind(&image.generation_id)
            .bind(image.job_id)
            .bind(&image.data)
            .bind(&image.model)
            .bind(&image.seed)
            .bind(&image.worker_id)
            .bind(&image.worker_name)
            .bind(image.kudos)
            .bind(Json(&image.gen_metadata))
            .bind(image.created_at)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn exists(pool: &DbPool, generation_id: &str) -> Result<bool, sqlx::Error> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM images WHERE generation_id = $1")
                .bind(generation_id)
                .fetch_optional(pool)
                .await?;
        Ok(found.is_some())
    }

    pub async fn count_for_job(pool: &DbPool, job_id: JobId) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM images WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(pool)
            .await
    }

    pub async fn list_for_job(
        pool: &DbPool,
        job_id: JobId,
    ) -> Result<Vec<ImageRecord>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM images WHERE job_id = $1 ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, ImageRecord>(&query)
            .bind(job_id)
            .fetch_all(pool)
            .await
    }
}
