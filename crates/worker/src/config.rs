//! Worker configuration loaded from environment variables.

use std::time::Duration;

use pixelq_core::rate_limit::{
    STATUS_MAX_REQUESTS, STATUS_WINDOW, SUBMIT_MAX_REQUESTS, SUBMIT_WINDOW,
};
use pixelq_horde::api::{ANONYMOUS_API_KEY, DEFAULT_TIMEOUT};
use pixelq_horde::HordeClientConfig;

/// Default cap on jobs in `Requested`, `Queued` or `Processing`.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a valid {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Timing and capacity knobs of the dispatch/poll cycle.
///
/// The defaults are the production values; tests shrink them.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    /// Period of the waiting-job dispatcher.
    pub dispatch_period: Duration,
    /// Period of the pending-job poller.
    pub poll_period: Duration,
    /// A poll tick starting sooner than this after the previous one is skipped.
    pub poll_min_interval: Duration,
    /// A remote id checked within this window is left out of the next batch.
    pub dedup_ttl: Duration,
    /// Poll pause after the remote API answers 429.
    pub rate_limit_backoff: Duration,
    /// Pause between an accepted submission and its first status check.
    pub settle_delay: Duration,
    /// Hard limit for one result-download task.
    pub task_timeout: Duration,
    /// Minimum gap between two result-download tasks.
    pub task_spacing: Duration,
    pub submit_max_requests: usize,
    pub submit_window: Duration,
    pub status_max_requests: usize,
    pub status_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            dispatch_period: Duration::from_millis(250),
            poll_period: Duration::from_millis(2000),
            poll_min_interval: Duration::from_millis(1500),
            dedup_ttl: Duration::from_millis(750),
            rate_limit_backoff: Duration::from_secs(15),
            settle_delay: Duration::from_millis(750),
            task_timeout: Duration::from_secs(30),
            task_spacing: Duration::from_millis(1000),
            submit_max_requests: SUBMIT_MAX_REQUESTS,
            submit_window: SUBMIT_WINDOW,
            status_max_requests: STATUS_MAX_REQUESTS,
            status_window: STATUS_WINDOW,
        }
    }
}

/// Everything the `pixelq-worker` binary needs to start.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub horde: HordeClientConfig,
    pub scheduler: SchedulerConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var               | Default                        |
    /// |-----------------------|--------------------------------|
    /// | `DATABASE_URL`        | `sqlite://pixelq.db?mode=rwc`  |
    /// | `HORDE_API_URL`       | `https://aihorde.net/api`      |
    /// | `HORDE_API_KEY`       | `0000000000`                   |
    /// | `HORDE_CLIENT_AGENT`  | `pixelq:<version>`             |
    /// | `MAX_CONCURRENT_JOBS` | `5`                            |
    /// | `HTTP_TIMEOUT_SECS`   | `25`                           |
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://pixelq.db?mode=rwc".into());

        let mut horde = HordeClientConfig::new(
            std::env::var("HORDE_API_URL").unwrap_or_else(|_| "https://aihorde.net/api".into()),
        );
        horde.api_key =
            std::env::var("HORDE_API_KEY").unwrap_or_else(|_| ANONYMOUS_API_KEY.into());
        if let Ok(agent) = std::env::var("HORDE_CLIENT_AGENT") {
            horde.client_agent = agent;
        }
        horde.timeout = Duration::from_secs(parse_var(
            "HTTP_TIMEOUT_SECS",
            std::env::var("HTTP_TIMEOUT_SECS").ok(),
            DEFAULT_TIMEOUT.as_secs(),
        )?);

        let scheduler = SchedulerConfig {
            max_concurrent_jobs: parse_var(
                "MAX_CONCURRENT_JOBS",
                std::env::var("MAX_CONCURRENT_JOBS").ok(),
                DEFAULT_MAX_CONCURRENT_JOBS,
            )?
            .max(1),
            ..Default::default()
        };

        Ok(Self {
            database_url,
            horde,
            scheduler,
        })
    }
}

/// Parse an optional raw env value, falling back to `default` when unset.
fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            expected: std::any::type_name::<T>(),
            value,
        }),
    }
}
