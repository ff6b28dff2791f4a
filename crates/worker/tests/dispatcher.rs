mod common;

use assert_matches::assert_matches;
use chrono::Utc;
use pixelq_core::job_errors::ErrorKind;
use pixelq_core::types::new_job_id;
use pixelq_db::models::job::JobRecord;
use pixelq_db::models::status::JobStatus;
use pixelq_horde::messages::CheckResponse;
use pixelq_worker::config::SchedulerConfig;
use pixelq_worker::dispatcher::DispatchTick;

use common::{fast_config, params, processing, FakeRemote, Harness, Reply};

async fn harness_with_cap(max_concurrent_jobs: usize) -> Harness {
    Harness::new(SchedulerConfig {
        max_concurrent_jobs,
        ..fast_config()
    })
    .await
}

#[tokio::test]
async fn tick_claims_only_free_slots_oldest_first() {
    let h = harness_with_cap(2).await;
    let first = h.intake.create_job(params(1)).await.unwrap();
    let second = h.intake.create_job(params(1)).await.unwrap();
    let third = h.intake.create_job(params(1)).await.unwrap();

    let tick = h.driver.dispatcher().tick().await;

    assert_matches!(tick, DispatchTick::Dispatched(s) if s.claimed == 2 && s.submitted == 2);
    assert_eq!(h.store.get(first.id).unwrap().status, JobStatus::Queued);
    assert_eq!(h.store.get(second.id).unwrap().status, JobStatus::Queued);
    assert_eq!(h.store.get(third.id).unwrap().status, JobStatus::Waiting);
    assert_eq!(FakeRemote::calls(&h.remote.submit_calls), 2);

    assert_eq!(h.driver.dispatcher().tick().await, DispatchTick::AtCapacity);
}

#[tokio::test]
async fn tick_without_waiting_jobs_does_nothing() {
    let h = harness_with_cap(2).await;
    assert_eq!(h.driver.dispatcher().tick().await, DispatchTick::NoWaitingJobs);
    assert_eq!(FakeRemote::calls(&h.remote.submit_calls), 0);
}

#[tokio::test]
async fn accepted_job_records_remote_id_and_first_status() {
    let h = harness_with_cap(5).await;
    h.remote.script_checks("remote-1", vec![Reply::Ok(processing(1))]);
    let job = h.intake.create_job(params(2)).await.unwrap();

    h.driver.dispatcher().tick().await;

    let job = h.store.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.remote_id.as_deref(), Some("remote-1"));
    assert_eq!(job.init_wait_time, Some(30));
    assert!(job.horde_received_timestamp.is_some());
    assert!(job.errors.is_empty());
}

#[tokio::test]
async fn impossible_job_is_queued_with_advisory() {
    let h = harness_with_cap(5).await;
    h.remote.script_checks(
        "remote-1",
        vec![Reply::Ok(CheckResponse {
            is_possible: false,
            ..Default::default()
        })],
    );
    let job = h.intake.create_job(params(1)).await.unwrap();

    h.driver.dispatcher().tick().await;

    let job = h.store.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(!job.is_possible);
    assert!(job.has_error(ErrorKind::NoAvailableWorkers));
}

#[tokio::test]
async fn failed_first_check_leaves_job_queued() {
    let h = harness_with_cap(5).await;
    h.remote.script_checks("remote-1", vec![Reply::ServerError]);
    let job = h.intake.create_job(params(1)).await.unwrap();

    h.driver.dispatcher().tick().await;

    let job = h.store.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.errors.is_empty());
}

#[tokio::test]
async fn rejected_submission_records_field_errors() {
    let h = harness_with_cap(5).await;
    h.remote
        .reject_submit("Input payload validation failed", &[("params.steps", "too many steps")]);
    let job = h.intake.create_job(params(1)).await.unwrap();

    let tick = h.driver.dispatcher().tick().await;

    assert_matches!(tick, DispatchTick::Dispatched(s) if s.failed == 1);
    let job = h.store.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.remote_id, None);
    assert_eq!(job.errors.len(), 2);
    assert_eq!(job.errors[0].kind, ErrorKind::SubmissionRejected);
    assert_eq!(job.errors[0].field.as_deref(), Some("params.steps"));
    assert_eq!(job.errors[1].message, "Input payload validation failed");
}

#[tokio::test]
async fn unreadable_submission_response_is_unknown_failure() {
    let h = harness_with_cap(5).await;
    h.remote.script_submit(Reply::Malformed);
    let job = h.intake.create_job(params(1)).await.unwrap();

    h.driver.dispatcher().tick().await;

    let job = h.store.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.has_error(ErrorKind::UnknownSubmissionFailure));
}

#[tokio::test]
async fn transport_failure_is_local_exception() {
    let h = harness_with_cap(5).await;
    h.remote.script_submit(Reply::ServerError);
    let job = h.intake.create_job(params(1)).await.unwrap();

    h.driver.dispatcher().tick().await;

    let job = h.store.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.has_error(ErrorKind::LocalException));
}

#[tokio::test]
async fn job_without_parameters_fails_without_submitting() {
    let h = harness_with_cap(5).await;
    let job = h
        .store
        .insert(JobRecord::waiting(new_job_id(), 1, Utc::now()))
        .await
        .unwrap();

    h.driver.dispatcher().tick().await;

    assert_eq!(h.store.get(job.id).unwrap().status, JobStatus::Error);
    assert_eq!(FakeRemote::calls(&h.remote.submit_calls), 0);
}

#[tokio::test]
async fn failed_jobs_free_their_slot() {
    let h = harness_with_cap(1).await;
    h.remote.reject_submit("Not enough kudos", &[]);
    h.intake.create_job(params(1)).await.unwrap();
    let next = h.intake.create_job(params(1)).await.unwrap();

    h.driver.dispatcher().tick().await;
    h.driver.dispatcher().tick().await;

    assert_eq!(h.store.get(next.id).unwrap().status, JobStatus::Queued);
}
