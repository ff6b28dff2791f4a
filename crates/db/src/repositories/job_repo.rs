//! Repository for the `jobs` table.

use pixelq_core::types::JobId;
use sqlx::types::Json;
use sqlx::SqliteExecutor;

use crate::models::image::ImageRecord;
use crate::models::job::JobRecord;
use crate::DbPool;

use super::{ImageRepo, ParamsRepo};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, status, remote_id, images_requested, images_completed, images_failed, \
    queue_position, wait_time, init_wait_time, is_possible, errors, api_response, \
    created_timestamp, horde_received_timestamp, horde_completed_timestamp, \
    updated_timestamp";

/// Provides persistence for job records.
pub struct JobRepo;

impl JobRepo {
    /// Insert or fully replace a job row.
    pub async fn upsert<'e, E>(executor: E, job: &JobRecord) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let query = format!(
            "INSERT INTO jobs ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             ON CONFLICT (id) DO UPDATE SET \
                 status = excluded.status, \
                 remote_id = excluded.remote_id, \
                 images_requested = excluded.images_requested, \
                 images_completed = excluded.images_completed, \
                 images_failed = excluded.images_failed, \
                 queue_position = excluded.queue_position, \
                 wait_time = excluded.wait_time, \
                 init_wait_time = excluded.init_wait_time, \
                 is_possible = excluded.is_possible, \
                 errors = excluded.errors, \
                 api_response = excluded.api_response, \
                 horde_received_timestamp = excluded.horde_received_timestamp, \
                 horde_completed_timestamp = excluded.horde_completed_timestamp, \
                 updated_timestamp = excluded.updated_timestamp"
        );
        sqlx::query(&query)
            .bind(job.id)
            .bind(job.status)
            .bind(&job.remote_id)
            .bind(job.images_requested)
            .bind(job.images_completed)
            .bind(job.images_failed)
            .bind(job.queue_position)
            .bind(job.wait_time)
            .bind(job.init_wait_time)
            .bind(job.is_possible)
            .bind(Json(&job.errors))
            .bind(Json(&job.api_response))
            .bind(job.created_timestamp)
            .bind(job.horde_received_timestamp)
            .bind(job.horde_completed_timestamp)
            .bind(job.updated_timestamp)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &DbPool, id: JobId) -> Result<Option<JobRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRecord>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// All jobs, oldest first.
    pub async fn list_all(pool: &DbPool) -> Result<Vec<JobRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs ORDER BY created_timestamp ASC");
        sqlx::query_as::<_, JobRecord>(&query).fetch_all(pool).await
    }

    /// Delete a job row. Returns `true` if a row was removed.
    pub async fn delete<'e, E>(executor: E, id: JobId) -> Result<bool, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a job together with its stored generation parameters.
    ///
    /// Downloaded images are kept; they outlive the job that produced them.
    pub async fn delete_with_params(pool: &DbPool, id: JobId) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;
        ParamsRepo::delete(&mut *tx, id).await?;
        let removed = Self::delete(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Persist new images and the job's updated record in one transaction.
    ///
    /// Images whose generation id already exists are skipped. Returns how
    /// many image rows were actually inserted.
    pub async fn commit_with_images(
        pool: &DbPool,
        job: &JobRecord,
        images: &[ImageRecord],
    ) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut inserted = 0;
        for image in images {
            inserted += ImageRepo::insert_if_absent(&mut *tx, image).await?;
        }
        Self::upsert(&mut *tx, job).await?;
        tx.commit().await?;

        tracing::debug!(
            job_id = %job.id,
            inserted,
            images_completed = job.images_completed,
            "Committed job with images",
        );
        Ok(inserted)
    }
}
