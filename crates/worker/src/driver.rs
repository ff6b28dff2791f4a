//! Wires the dispatcher and poller to fixed-interval timers.
//!
//! Both loops fire on their own period whether or not the previous tick
//! finished; overlapping ticks are made safe by the claim in the
//! dispatcher and the in-progress guard in the poller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pixelq_core::rate_limit::RateLimiter;
use pixelq_horde::GenerationApi;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::dispatcher::WaitingDispatcher;
use crate::poller::{PendingPoller, PollTimings};
use crate::reconciler::CompletionReconciler;
use crate::store::JobRecordStore;
use crate::task_queue::TaskQueue;

/// How long shutdown waits for a loop to wind down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Driver {
    dispatcher: Arc<WaitingDispatcher>,
    poller: Arc<PendingPoller>,
    dispatch_period: Duration,
    poll_period: Duration,
}

impl Driver {
    /// Build the full component graph over one remote API handle.
    ///
    /// The submit limiter is used only by the dispatcher; the status
    /// limiter is shared by every status check and result fetch.
    pub fn new(
        store: Arc<JobRecordStore>,
        api: Arc<dyn GenerationApi>,
        config: &SchedulerConfig,
    ) -> Self {
        let submit_limiter = Arc::new(RateLimiter::new(
            config.submit_max_requests,
            config.submit_window,
        ));
        let status_limiter = Arc::new(RateLimiter::new(
            config.status_max_requests,
            config.status_window,
        ));

        let dispatcher = Arc::new(WaitingDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&api),
            submit_limiter,
            Arc::clone(&status_limiter),
            config.max_concurrent_jobs,
            config.settle_delay,
        ));

        let queue = Arc::new(TaskQueue::new(
            true,
            config.task_timeout,
            config.task_spacing,
        ));
        let reconciler = Arc::new(CompletionReconciler::new(
            Arc::clone(&store),
            Arc::clone(&api),
            Arc::clone(&status_limiter),
        ));
        let poller = Arc::new(PendingPoller::new(
            store,
            api,
            status_limiter,
            queue,
            reconciler,
            PollTimings {
                min_interval: config.poll_min_interval,
                dedup_ttl: config.dedup_ttl,
                rate_limit_backoff: config.rate_limit_backoff,
            },
        ));

        Self {
            dispatcher,
            poller,
            dispatch_period: config.dispatch_period,
            poll_period: config.poll_period,
        }
    }

    pub fn dispatcher(&self) -> &Arc<WaitingDispatcher> {
        &self.dispatcher
    }

    pub fn poller(&self) -> &Arc<PendingPoller> {
        &self.poller
    }

    /// Run one tick of each component, then start both timers.
    pub async fn start(self) -> DriverHandle {
        let cancel = CancellationToken::new();

        let first_dispatch = self.dispatcher.tick().await;
        let first_poll = self.poller.tick().await;
        tracing::info!(
            dispatch = ?first_dispatch,
            poll = ?first_poll,
            dispatch_period_ms = self.dispatch_period.as_millis() as u64,
            poll_period_ms = self.poll_period.as_millis() as u64,
            "Job driver started",
        );

        let dispatcher = self.dispatcher;
        let dispatch = tokio::spawn(run_loop(
            "dispatcher",
            self.dispatch_period,
            cancel.clone(),
            move || {
                let dispatcher = Arc::clone(&dispatcher);
                async move {
                    dispatcher.tick().await;
                }
            },
        ));

        let poller = self.poller;
        let poll = tokio::spawn(run_loop("poller", self.poll_period, cancel.clone(), move || {
            let poller = Arc::clone(&poller);
            async move {
                poller.tick().await;
            }
        }));

        DriverHandle {
            cancel,
            dispatch,
            poll,
        }
    }
}

/// Controls a running [`Driver`].
pub struct DriverHandle {
    cancel: CancellationToken,
    dispatch: JoinHandle<()>,
    poll: JoinHandle<()>,
}

impl DriverHandle {
    /// Token cancelled on shutdown; clone it to tie other tasks to the driver.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop both timers and abort ticks still in flight.
    ///
    /// A job caught mid-submission stays in `Requested` and is recovered
    /// the next time the store is loaded.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in [("dispatcher", self.dispatch), ("poller", self.poll)] {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(task = name, error = %e, "Driver task failed"),
                Err(_) => tracing::warn!(task = name, "Driver task did not stop in time"),
            }
        }
        tracing::info!("Job driver stopped");
    }
}

/// Fire `tick` every `period` until cancelled. Ticks run as their own
/// tasks, so a slow tick never delays the next one.
async fn run_loop<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, tick: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(task = name, in_flight = in_flight.len(), "Loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                while let Some(done) = in_flight.try_join_next() {
                    if let Err(e) = done {
                        tracing::error!(task = name, error = %e, "Tick panicked");
                    }
                }
                in_flight.spawn(tick());
            }
        }
    }

    in_flight.shutdown().await;
}
