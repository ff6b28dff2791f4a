//! Repository round-trips against an in-memory SQLite database.

use chrono::Utc;
use pixelq_core::job_errors::JobError;
use pixelq_core::params::GenerationParams;
use pixelq_core::types::new_job_id;
use pixelq_db::models::image::ImageRecord;
use pixelq_db::models::job::{JobPatch, JobRecord};
use pixelq_db::models::status::JobStatus;
use pixelq_db::repositories::{ImageRepo, JobRepo, ParamsRepo};
use pixelq_db::DbPool;

async fn test_pool() -> DbPool {
    let pool = pixelq_db::create_pool("sqlite::memory:").await.unwrap();
    pixelq_db::run_migrations(&pool).await.unwrap();
    pool
}

fn image(job: &JobRecord, generation_id: &str) -> ImageRecord {
    ImageRecord {
        generation_id: generation_id.to_string(),
        job_id: job.id,
        data: vec![0x89, 0x50, 0x4e, 0x47],
        model: Some("Deliberate".into()),
        seed: Some("1234".into()),
        worker_id: Some("w-1".into()),
        worker_name: Some("worker one".into()),
        kudos: 5.0,
        gen_metadata: serde_json::json!([]),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn health_check_passes_after_migrations() {
    let pool = test_pool().await;
    pixelq_db::health_check(&pool).await.unwrap();
}

#[tokio::test]
async fn job_upsert_round_trips_every_field() {
    let pool = test_pool().await;
    let mut job = JobRecord::waiting(new_job_id(), 3, Utc::now());
    job.apply(&JobPatch::status(JobStatus::Requested), Utc::now());
    job.apply(
        &JobPatch {
            status: Some(JobStatus::Queued),
            remote_id: Some("remote-1".into()),
            wait_time: Some(42),
            queue_position: Some(7),
            is_possible: Some(false),
            api_response: Some(serde_json::json!({"waiting": 3})),
            ..Default::default()
        }
        .with_error(JobError::no_workers()),
        Utc::now(),
    );

    JobRepo::upsert(&pool, &job).await.unwrap();
    let loaded = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();

    assert_eq!(loaded.status, JobStatus::Queued);
    assert_eq!(loaded.remote_id.as_deref(), Some("remote-1"));
    assert_eq!(loaded.init_wait_time, Some(42));
    assert!(!loaded.is_possible);
    assert_eq!(loaded.errors, job.errors);
    assert_eq!(loaded.api_response["waiting"], 3);
    assert!(loaded.horde_received_timestamp.is_some());
}

#[tokio::test]
async fn upsert_replaces_existing_row() {
    let pool = test_pool().await;
    let mut job = JobRecord::waiting(new_job_id(), 1, Utc::now());
    JobRepo::upsert(&pool, &job).await.unwrap();

    job.apply(&JobPatch::status(JobStatus::Requested), Utc::now());
    JobRepo::upsert(&pool, &job).await.unwrap();

    let all = JobRepo::list_all(&pool).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, JobStatus::Requested);
}

#[tokio::test]
async fn commit_with_images_skips_known_generations() {
    let pool = test_pool().await;
    let mut job = JobRecord::waiting(new_job_id(), 2, Utc::now());
    JobRepo::upsert(&pool, &job).await.unwrap();

    let first = JobRepo::commit_with_images(&pool, &job, &[image(&job, "gen-a")])
        .await
        .unwrap();
    assert_eq!(first, 1);

    job.images_completed = 2;
    let second = JobRepo::commit_with_images(
        &pool,
        &job,
        &[image(&job, "gen-a"), image(&job, "gen-b")],
    )
    .await
    .unwrap();
    assert_eq!(second, 1);

    assert_eq!(ImageRepo::count_for_job(&pool, job.id).await.unwrap(), 2);
    assert!(ImageRepo::exists(&pool, "gen-b").await.unwrap());
    assert!(!ImageRepo::exists(&pool, "gen-z").await.unwrap());
    let stored = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.images_completed, 2);

    let images = ImageRepo::list_for_job(&pool, job.id).await.unwrap();
    assert_eq!(images[0].worker_name.as_deref(), Some("worker one"));
}

#[tokio::test]
async fn params_round_trip_and_delete_with_job() {
    let pool = test_pool().await;
    let job = JobRecord::waiting(new_job_id(), 1, Utc::now());
    let params = GenerationParams {
        prompt: "a red fox in snow".into(),
        ..Default::default()
    };

    JobRepo::upsert(&pool, &job).await.unwrap();
    ParamsRepo::insert(&pool, job.id, &params).await.unwrap();
    assert_eq!(ParamsRepo::find(&pool, job.id).await.unwrap(), Some(params));

    assert!(JobRepo::delete_with_params(&pool, job.id).await.unwrap());
    assert_eq!(ParamsRepo::find(&pool, job.id).await.unwrap(), None);
    assert!(JobRepo::find_by_id(&pool, job.id).await.unwrap().is_none());
    assert!(!JobRepo::delete_with_params(&pool, job.id).await.unwrap());
}
