//! Job orchestration for pixelq.
//!
//! Jobs enter through [`intake::JobIntake`] in `Waiting`. The
//! [`dispatcher::WaitingDispatcher`] submits them to the remote cluster
//! within the concurrency cap, the [`poller::PendingPoller`] follows them
//! while they run, and the [`reconciler::CompletionReconciler`] stores
//! their images. [`driver::Driver`] runs the dispatcher and poller on
//! timers. All state lives in [`store::JobRecordStore`].

pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod intake;
pub mod poller;
pub mod reconciler;
pub mod store;
pub mod task_queue;
