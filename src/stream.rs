//! Stream API: follow a task's stage events as a `Stream`.
//!
//! [`observe`] is the pull-based counterpart of
//! [`crate::TaskHandle::subscribe`]. The stream first yields every transition
//! the task has already made, then live ones, and ends right after the
//! terminal event. Dropping the stream early unsubscribes it.
//!
//! ```rust,no_run
//! # async fn demo(task: paperflow::TaskHandle) {
//! use futures::StreamExt;
//!
//! let mut events = paperflow::observe(&task);
//! while let Some(event) = events.next().await {
//!     println!("{} -> {}", event.previous, event.stage);
//! }
//! # }
//! ```

use crate::error::FailureReason;
use crate::pipeline::task::{StageEvent, SubscriptionId, TaskHandle};
use crate::progress::StageObserver;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

/// A boxed stream of stage events from any number of tasks.
pub type EventStream = Pin<Box<dyn Stream<Item = StageEvent> + Send>>;

struct ChannelObserver {
    tx: mpsc::UnboundedSender<StageEvent>,
}

impl ChannelObserver {
    fn forward(&self, event: &StageEvent) {
        // Receiver gone means the stream was dropped; nothing to do.
        let _ = self.tx.send(event.clone());
    }
}

impl StageObserver for ChannelObserver {
    fn on_stage_change(&self, event: &StageEvent) {
        self.forward(event);
    }

    fn on_completed(&self, event: &StageEvent) {
        self.forward(event);
    }

    fn on_failed(&self, event: &StageEvent, _reason: &FailureReason) {
        self.forward(event);
    }
}

/// Stage events of one task, history first.
pub struct StageStream {
    inner: UnboundedReceiverStream<StageEvent>,
    task: TaskHandle,
    subscription: SubscriptionId,
}

impl Stream for StageStream {
    type Item = StageEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for StageStream {
    fn drop(&mut self) {
        self.task.unsubscribe(self.subscription);
    }
}

/// Follow `task` from its first transition to its terminal event.
pub fn observe(task: &TaskHandle) -> StageStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = task.subscribe_from_start(Arc::new(ChannelObserver { tx }));
    StageStream {
        inner: UnboundedReceiverStream::new(rx),
        task: task.clone(),
        subscription,
    }
}

/// Merge the event streams of several tasks.
///
/// Events of one task keep their order; events of different tasks
/// interleave in arrival order. Ends once every task has finished.
pub fn observe_all<'a>(tasks: impl IntoIterator<Item = &'a TaskHandle>) -> EventStream {
    stream::select_all(tasks.into_iter().map(observe)).boxed()
}
