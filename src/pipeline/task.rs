//! The task record and the shared handle observers hold.
//!
//! A [`TaskHandle`] is cheap to clone. All writes go through
//! [`TaskHandle::advance`]-style crate-internal methods that validate the
//! transition against [`Stage::can_transition`], so the stage never
//! regresses and identifiers, once assigned, never change.

use crate::error::{FailureReason, PipelineError};
use crate::pipeline::stage::{FlowKind, Stage};
use crate::progress::{dispatch, StageObserver};
use crate::remote::{Document, FileKind, JobId, JobKind, StatusRecord, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::info;

// ── Results ──────────────────────────────────────────────────────────────

/// Terminal payload of a task. Set exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskResult {
    Success(TaskArtifact),
    Failure { reason: FailureReason },
}

/// What a completed task produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskArtifact {
    /// Which job's completion ended the task.
    pub job_kind: JobKind,
    pub job_id: JobId,
    pub word_count: u64,
    pub report_url: Option<String>,
    pub score: Option<f64>,
    pub output_url: Option<String>,
    /// The full status record as the remote reported it.
    pub record: StatusRecord,
}

impl TaskArtifact {
    pub fn from_record(job_kind: JobKind, word_count: u64, record: StatusRecord) -> Self {
        Self {
            job_kind,
            job_id: record.job_id.clone(),
            word_count,
            report_url: record.report_url.clone(),
            score: record.score,
            output_url: record.output_url.clone(),
            record,
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────

/// One stage transition, as delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub task_id: Option<TaskId>,
    pub stage: Stage,
    pub previous: Stage,
    pub word_count: Option<u64>,
    /// Present on the terminal event only.
    pub result: Option<TaskResult>,
    /// Set when a finished task's terminal event is re-delivered to a late
    /// subscriber.
    pub replay: bool,
}

impl StageEvent {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.result {
            Some(TaskResult::Failure { reason }) => Some(reason),
            _ => None,
        }
    }

    pub fn artifact(&self) -> Option<&TaskArtifact> {
        match &self.result {
            Some(TaskResult::Success(artifact)) => Some(artifact),
            _ => None,
        }
    }
}

// ── Task record ──────────────────────────────────────────────────────────

/// One document's journey through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub document_name: String,
    pub file_kind: FileKind,
    pub flow: FlowKind,
    pub stage: Stage,
    pub task_id: Option<TaskId>,
    pub word_count: Option<u64>,
    pub detection_job_id: Option<JobId>,
    pub reduction_job_id: Option<JobId>,
    pub result: Option<TaskResult>,
}

/// A point-in-time copy of a task, as returned by [`TaskHandle::snapshot`].
pub type TaskSnapshot = Task;

impl Task {
    fn new(document: &Document, flow: FlowKind) -> Self {
        Self {
            document_name: document.name.clone(),
            file_kind: document.kind,
            flow,
            stage: Stage::Idle,
            task_id: None,
            word_count: None,
            detection_job_id: None,
            reduction_job_id: None,
            result: None,
        }
    }

    fn apply(&mut self, update: Update) -> Result<(), PipelineError> {
        match update {
            Update::Nothing => Ok(()),
            Update::WordCount(n) => set_once(&mut self.word_count, n, "word count"),
            Update::Job(JobKind::Detect, id) => {
                set_once(&mut self.detection_job_id, id, "detection job id")
            }
            Update::Job(JobKind::Reduce, id) => {
                set_once(&mut self.reduction_job_id, id, "reduction job id")
            }
            Update::Result(result) => set_once(&mut self.result, result, "result"),
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, what: &str) -> Result<(), PipelineError> {
    if slot.is_some() {
        return Err(PipelineError::Internal(format!("{what} is already set")));
    }
    *slot = Some(value);
    Ok(())
}

/// Field written together with a transition.
pub(crate) enum Update {
    Nothing,
    WordCount(u64),
    Job(JobKind, JobId),
    Result(TaskResult),
}

// ── Handle ───────────────────────────────────────────────────────────────

/// Identifies one observer registration on one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    active: AtomicBool,
    observer: Arc<dyn StageObserver>,
}

struct TaskState {
    task: Task,
    history: Vec<StageEvent>,
    subscriptions: Vec<Arc<Subscription>>,
}

struct TaskInner {
    state: Mutex<TaskState>,
    /// Serialises observer delivery so events of one task never interleave.
    delivery: Mutex<()>,
    next_subscription: AtomicU64,
    /// Set while a job submission for this task is awaiting the remote.
    submitting: AtomicBool,
    stage_tx: watch::Sender<Stage>,
}

pub(crate) struct SubmissionGuard {
    inner: Arc<TaskInner>,
}

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        self.inner.submitting.store(false, Ordering::Release);
    }
}

/// Shared handle to a task: read its stage, subscribe to its events, wait
/// for its result.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskHandle {
    /// A new task in `Idle`.
    pub fn new(document: &Document, flow: FlowKind) -> Self {
        let (stage_tx, _) = watch::channel(Stage::Idle);
        Self {
            inner: Arc::new(TaskInner {
                state: Mutex::new(TaskState {
                    task: Task::new(document, flow),
                    history: Vec::new(),
                    subscriptions: Vec::new(),
                }),
                delivery: Mutex::new(()),
                next_subscription: AtomicU64::new(1),
                submitting: AtomicBool::new(false),
                stage_tx,
            }),
        }
    }

    /// The stage right now. Never blocks on remote work.
    pub fn current_stage(&self) -> Stage {
        lock(&self.inner.state).task.stage
    }

    /// A copy of the full task record.
    pub fn snapshot(&self) -> Task {
        lock(&self.inner.state).task.clone()
    }

    pub fn task_id(&self) -> Option<TaskId> {
        lock(&self.inner.state).task.task_id.clone()
    }

    pub fn flow(&self) -> FlowKind {
        lock(&self.inner.state).task.flow
    }

    /// Every transition so far, in order.
    pub fn history(&self) -> Vec<StageEvent> {
        lock(&self.inner.state).history.clone()
    }

    /// Deliver future transitions to `observer`.
    ///
    /// If the task has already finished, its terminal event is replayed to
    /// `observer` once (with `replay` set) and nothing is registered.
    pub fn subscribe(&self, observer: Arc<dyn StageObserver>) -> SubscriptionId {
        let id = self.next_id();
        let replay = {
            let mut state = lock(&self.inner.state);
            if state.task.stage.is_terminal() {
                state.history.last().cloned()
            } else {
                state.subscriptions.push(Arc::new(Subscription {
                    id,
                    active: AtomicBool::new(true),
                    observer: Arc::clone(&observer),
                }));
                None
            }
        };

        if let Some(mut event) = replay {
            event.replay = true;
            dispatch(observer.as_ref(), &event);
        }
        id
    }

    /// Stop delivering to a subscription. Returns `false` if it was not
    /// registered (already removed, or the task has finished).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = lock(&self.inner.state);
        match state.subscriptions.iter().position(|s| s.id == id) {
            Some(pos) => {
                let sub = state.subscriptions.remove(pos);
                sub.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Replay the history so far to `observer`, then register it for the
    /// rest. History and registration happen under one lock, so the
    /// observer sees every transition exactly once.
    ///
    /// `observer` is called with the state lock held and must not call
    /// back into this handle.
    pub(crate) fn subscribe_from_start(&self, observer: Arc<dyn StageObserver>) -> SubscriptionId {
        let id = self.next_id();
        let mut state = lock(&self.inner.state);
        for event in &state.history {
            dispatch(observer.as_ref(), event);
        }
        if !state.task.stage.is_terminal() {
            state.subscriptions.push(Arc::new(Subscription {
                id,
                active: AtomicBool::new(true),
                observer,
            }));
        }
        id
    }

    /// Wait until the task reaches `Completed` or `Failed` and return the
    /// final record. All observers have been notified by the time this
    /// returns.
    pub async fn wait(&self) -> Task {
        let mut rx = self.inner.stage_tx.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|stage| stage.is_terminal()).await;
        self.snapshot()
    }

    /// The terminal result, if the task has finished.
    pub fn result(&self) -> Option<TaskResult> {
        lock(&self.inner.state).task.result.clone()
    }

    // ── Crate-internal writes ────────────────────────────────────────────

    /// Claim the task for one job submission. `None` while another
    /// submission is still in flight; the claim ends when the guard drops.
    pub(crate) fn claim_submission(&self) -> Option<SubmissionGuard> {
        self.inner
            .submitting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SubmissionGuard {
                inner: Arc::clone(&self.inner),
            })
    }

    /// Record the id issued with the upload credentials. Only allowed once,
    /// while uploading.
    pub(crate) fn assign_task_id(&self, task_id: TaskId) -> Result<(), PipelineError> {
        let mut state = lock(&self.inner.state);
        if state.task.stage != Stage::Uploading {
            return Err(PipelineError::InvalidTransition {
                from: state.task.stage,
                to: Stage::Uploading,
            });
        }
        set_once(&mut state.task.task_id, task_id, "task id")
    }

    pub(crate) fn advance(&self, to: Stage, update: Update) -> Result<StageEvent, PipelineError> {
        if to.is_terminal() != matches!(update, Update::Result(_)) {
            return Err(PipelineError::Internal(format!(
                "transition to {to} must carry a result exactly when terminal"
            )));
        }

        let _delivery = lock(&self.inner.delivery);
        let (event, targets) = {
            let mut state = lock(&self.inner.state);
            let from = state.task.stage;
            if !from.can_transition(to, state.task.flow) {
                return Err(PipelineError::InvalidTransition { from, to });
            }
            state.task.apply(update)?;
            state.task.stage = to;

            let event = StageEvent {
                task_id: state.task.task_id.clone(),
                stage: to,
                previous: from,
                word_count: state.task.word_count,
                result: state.task.result.clone(),
                replay: false,
            };
            state.history.push(event.clone());

            // Observers are released once the task is finished.
            let targets = if to.is_terminal() {
                std::mem::take(&mut state.subscriptions)
            } else {
                state.subscriptions.clone()
            };
            (event, targets)
        };

        info!(
            task_id = event.task_id.as_ref().map(|t| t.0.as_str()).unwrap_or("-"),
            from = %event.previous,
            to = %event.stage,
            "Stage transition"
        );

        for sub in &targets {
            if sub.active.load(Ordering::SeqCst) {
                dispatch(sub.observer.as_ref(), &event);
            }
        }
        self.inner.stage_tx.send_replace(to);
        Ok(event)
    }

    pub(crate) fn complete(&self, artifact: TaskArtifact) -> Result<StageEvent, PipelineError> {
        self.advance(Stage::Completed, Update::Result(TaskResult::Success(artifact)))
    }

    pub(crate) fn fail(&self, reason: FailureReason) -> Result<StageEvent, PipelineError> {
        self.advance(Stage::Failed, Update::Result(TaskResult::Failure { reason }))
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("TaskHandle")
            .field("task", &state.task)
            .field("subscriptions", &state.subscriptions.len())
            .finish()
    }
}
