//! Shared helpers for worker integration tests: an in-memory database and a
//! scripted stand-in for the remote cluster.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use pixelq_core::params::GenerationParams;
use pixelq_db::DbPool;
use pixelq_horde::messages::{
    CheckResponse, ErrorResponse, Generation, StatusResponse, SubmitOutcome, SubmitResponse,
};
use pixelq_horde::payload::GenerationPayload;
use pixelq_horde::{GenerationApi, HordeApiError};
use pixelq_worker::config::SchedulerConfig;
use pixelq_worker::driver::Driver;
use pixelq_worker::intake::JobIntake;
use pixelq_worker::store::JobRecordStore;

pub async fn test_pool() -> DbPool {
    let pool = pixelq_db::create_pool("sqlite::memory:")
        .await
        .expect("in-memory pool");
    pixelq_db::run_migrations(&pool).await.expect("migrations");
    pool
}

/// Scheduler settings with the waits squeezed out.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_jobs: 5,
        poll_min_interval: Duration::ZERO,
        dedup_ttl: Duration::ZERO,
        settle_delay: Duration::ZERO,
        task_spacing: Duration::ZERO,
        submit_max_requests: 100,
        status_max_requests: 100,
        ..Default::default()
    }
}

pub fn params(num_images: u32) -> GenerationParams {
    GenerationParams {
        prompt: "a lighthouse at dusk".into(),
        num_images,
        ..Default::default()
    }
}

/// A scripted reply; converted to a fresh `Result` on every call because
/// the client error type is not `Clone`.
#[derive(Debug, Clone)]
pub enum Reply<T> {
    Ok(T),
    NotFound,
    RateLimited,
    Malformed,
    ServerError,
}

impl<T> Reply<T> {
    fn into_result(self) -> Result<T, HordeApiError> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::NotFound => Err(HordeApiError::NotFound),
            Self::RateLimited => Err(HordeApiError::RateLimited),
            Self::Malformed => Err(HordeApiError::Malformed("null".into())),
            Self::ServerError => Err(HordeApiError::Api {
                status: 500,
                message: "Internal Server Error".into(),
            }),
        }
    }
}

/// Fake remote cluster.
///
/// Submissions are accepted with ids `remote-1`, `remote-2`, ... unless a
/// reply is scripted. Status checks pop from a per-id script; the last
/// entry repeats.
#[derive(Default)]
pub struct FakeRemote {
    submit_script: Mutex<VecDeque<Reply<SubmitOutcome>>>,
    checks: Mutex<HashMap<String, VecDeque<Reply<CheckResponse>>>>,
    results: Mutex<HashMap<String, Reply<StatusResponse>>>,
    broken_images: Mutex<Vec<String>>,
    check_gate: Mutex<Option<Arc<Notify>>>,
    pub submit_calls: AtomicUsize,
    pub check_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_submit(&self, reply: Reply<SubmitOutcome>) {
        self.submit_script.lock().unwrap().push_back(reply);
    }

    pub fn reject_submit(&self, message: &str, fields: &[(&str, &str)]) {
        let errors = (!fields.is_empty()).then(|| {
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect()
        });
        self.script_submit(Reply::Ok(SubmitOutcome::Rejected {
            status: 400,
            error: ErrorResponse {
                message: Some(message.to_string()),
                rc: Some("ValidationError".into()),
                errors,
            },
        }));
    }

    pub fn script_checks(&self, remote_id: &str, replies: Vec<Reply<CheckResponse>>) {
        self.checks
            .lock()
            .unwrap()
            .insert(remote_id.to_string(), replies.into());
    }

    pub fn script_results(&self, remote_id: &str, reply: Reply<StatusResponse>) {
        self.results
            .lock()
            .unwrap()
            .insert(remote_id.to_string(), reply);
    }

    pub fn break_image(&self, image_ref: &str) {
        self.broken_images.lock().unwrap().push(image_ref.to_string());
    }

    /// Make status checks wait until [`release_checks`](Self::release_checks).
    pub fn hold_checks(&self) {
        *self.check_gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    pub fn release_checks(&self) {
        if let Some(gate) = self.check_gate.lock().unwrap().take() {
            gate.notify_waiters();
        }
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationApi for FakeRemote {
    async fn submit(&self, _payload: &GenerationPayload) -> Result<SubmitOutcome, HordeApiError> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.submit_script.lock().unwrap().pop_front() {
            Some(reply) => reply.into_result(),
            None => Ok(SubmitOutcome::Accepted(SubmitResponse {
                id: format!("remote-{n}"),
                kudos: 10.0,
                message: None,
                warnings: Vec::new(),
            })),
        }
    }

    async fn check_status(&self, remote_id: &str) -> Result<CheckResponse, HordeApiError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.check_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut checks = self.checks.lock().unwrap();
        let reply = match checks.get_mut(remote_id) {
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().cloned(),
            None => None,
        };
        reply
            .unwrap_or(Reply::Ok(CheckResponse::default()))
            .into_result()
    }

    async fn fetch_results(&self, remote_id: &str) -> Result<StatusResponse, HordeApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .unwrap()
            .get(remote_id)
            .cloned()
            .unwrap_or(Reply::NotFound)
            .into_result()
    }

    async fn download_image(&self, image_ref: &str) -> Result<Vec<u8>, HordeApiError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken_images.lock().unwrap().iter().any(|r| r == image_ref) {
            return Err(HordeApiError::NotFound);
        }
        Ok(format!("webp:{image_ref}").into_bytes())
    }
}

pub fn generation(id: &str, censored: bool) -> Generation {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "img": format!("https://cdn.example/{id}.webp"),
        "seed": "1234",
        "worker_id": "w-1",
        "worker_name": "Lighthouse Keeper",
        "model": "stable_diffusion",
        "censored": censored,
    }))
    .expect("generation fixture")
}

pub fn processing(n: i64) -> CheckResponse {
    CheckResponse {
        processing: n,
        wait_time: 30,
        queue_position: 0,
        ..Default::default()
    }
}

pub fn queued(position: i64, wait_time: i64) -> CheckResponse {
    CheckResponse {
        waiting: 1,
        queue_position: position,
        wait_time,
        ..Default::default()
    }
}

pub fn done(finished: i64) -> CheckResponse {
    CheckResponse {
        finished,
        done: true,
        ..Default::default()
    }
}

/// Everything a test needs, wired the way the binary wires it.
pub struct Harness {
    pub pool: DbPool,
    pub store: Arc<JobRecordStore>,
    pub remote: Arc<FakeRemote>,
    pub intake: JobIntake,
    pub driver: Driver,
}

impl Harness {
    pub async fn new(config: SchedulerConfig) -> Self {
        let pool = test_pool().await;
        let store = Arc::new(JobRecordStore::new(pool.clone()));
        let remote = FakeRemote::new();
        let api: Arc<dyn GenerationApi> = remote.clone();
        let driver = Driver::new(Arc::clone(&store), api, &config);
        let intake = JobIntake::new(Arc::clone(&store));
        Self {
            pool,
            store,
            remote,
            intake,
            driver,
        }
    }
}
