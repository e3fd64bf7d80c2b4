//! Observer trait for per-task stage events.
//!
//! Register an [`Arc<dyn StageObserver>`] with
//! [`crate::TaskHandle::subscribe`] (one task) or
//! [`crate::PipelineConfigBuilder::observer`] (every task) to follow a
//! document through the pipeline. This is the hook presentation code uses to
//! render progress; it never takes part in the state machine itself.
//!
//! # Delivery guarantees
//!
//! For one task, every transition after `Idle` is delivered exactly once, in
//! stage order. Exactly one of `on_completed` / `on_failed` is the last call
//! an observer receives. Subscribing to a task that has already finished
//! replays its terminal event once, with [`StageEvent::replay`] set.
//!
//! Observers run on whichever task drives the transition (the caller's task
//! for upload, parse and submit; the scheduler's task for the final result),
//! so implementations must be `Send + Sync` and should return quickly.
//! They must not drive the same task's pipeline from inside a callback.
//!
//! # Example
//!
//! ```rust
//! use paperflow::{StageEvent, StageObserver};
//! use std::sync::{Arc, Mutex};
//!
//! #[derive(Default)]
//! struct StageLog(Mutex<Vec<String>>);
//!
//! impl StageObserver for StageLog {
//!     fn on_stage_change(&self, event: &StageEvent) {
//!         self.0.lock().unwrap().push(event.stage.to_string());
//!     }
//! }
//!
//! let log: Arc<dyn StageObserver> = Arc::new(StageLog::default());
//! ```

use crate::error::FailureReason;
use crate::pipeline::task::StageEvent;
use std::sync::Arc;

/// Receives stage transitions of a task.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait StageObserver: Send + Sync {
    /// A non-terminal stage was entered (`Uploading` … `Polling`).
    fn on_stage_change(&self, event: &StageEvent) {
        let _ = event;
    }

    /// The task reached `Completed`; `event.result` holds the artifact.
    fn on_completed(&self, event: &StageEvent) {
        let _ = event;
    }

    /// The task reached `Failed`.
    fn on_failed(&self, event: &StageEvent, reason: &FailureReason) {
        let _ = (event, reason);
    }
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl StageObserver for NoopObserver {}

/// Convenience alias matching the type stored in [`crate::PipelineConfig`].
pub type ObserverRef = Arc<dyn StageObserver>;

/// Route an event to the one observer method it belongs to.
pub(crate) fn dispatch(observer: &dyn StageObserver, event: &StageEvent) {
    match event.failure() {
        Some(reason) => observer.on_failed(event, reason),
        None if event.stage.is_terminal() => observer.on_completed(event),
        None => observer.on_stage_change(event),
    }
}
