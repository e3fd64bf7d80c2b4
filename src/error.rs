//! Error types for the paperflow library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`PipelineError`]: returned as `Err(..)` from fallible API calls
//!   (remote transport failure, malformed payload, an operation invoked in
//!   the wrong stage, bad configuration).
//!
//! * [`FailureReason`]: what a task records when it reaches
//!   [`crate::Stage::Failed`]. It is part of the task's terminal result, so it
//!   is `Clone` and serialisable and is handed to every observer.
//!
//! * [`UpgradeError`]: membership-upgrade eligibility violations from
//!   [`crate::pricing`]. Never retried.
//!
//! A stage-level `PipelineError` is converted into a `FailureReason` by the
//! orchestrator; it is never swallowed.

use crate::pipeline::stage::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the paperflow library API.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Remote errors ─────────────────────────────────────────────────────
    /// Network or storage failure. Retried by the polling scheduler,
    /// fatal for one-shot stage calls.
    #[error("{operation}: transport error: {detail}")]
    Transport { operation: String, detail: String },

    /// The remote answered with a body we could not interpret.
    #[error("{operation}: malformed response: {detail}")]
    MalformedPayload { operation: String, detail: String },

    /// The JSON envelope carried a non-success code.
    #[error("{operation}: rejected by remote (code {code}): {message}")]
    RemoteRejected {
        operation: String,
        code: i64,
        message: String,
    },

    // ── State machine errors ──────────────────────────────────────────────
    /// The operation is not allowed from the task's current stage.
    #[error("Cannot move task from {from} to {to}")]
    InvalidTransition { from: Stage, to: Stage },

    /// A stage needs the remote task id, but upload credentials were never issued.
    #[error("Task has no remote task id yet")]
    MissingTaskId,

    /// Another job submission for the same task is still awaiting the remote.
    #[error("A job submission for this task is already in progress")]
    SubmissionInProgress,

    /// The polling scheduler has shut down and no longer accepts job ids.
    #[error("Polling scheduler is closed")]
    SchedulerClosed,

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input is empty, of an unsupported kind, or its content does not
    /// match its declared kind.
    #[error("Invalid input '{input}': {reason}")]
    InvalidInput { input: String, reason: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Build a [`PipelineError::Transport`] from anything displayable.
    pub fn transport(operation: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        PipelineError::Transport {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }

    /// Build a [`PipelineError::MalformedPayload`] from anything displayable.
    pub fn malformed(operation: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        PipelineError::MalformedPayload {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }

    /// Whether the polling scheduler should retry on its next tick.
    ///
    /// Only transport failures qualify; a malformed payload or an explicit
    /// rejection will not improve by asking again.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transport { .. })
    }
}

/// Why a task ended in [`Stage::Failed`].
///
/// Stored in the task's terminal result and replayed to late observers.
/// Every variant renders a non-empty message.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Storage answered the signed upload with something other than the
    /// configured "created" status.
    #[error("upload rejected: storage returned HTTP {status}")]
    UploadRejected { status: u16 },

    /// A one-shot stage call (upload, parse, submit) failed.
    #[error("{stage} failed: {detail}")]
    Stage { stage: Stage, detail: String },

    /// The remote service reported an explicit failure state for the job.
    #[error("job {job_id} failed remotely: {message}")]
    RemoteFailure { job_id: String, message: String },

    /// The remote service reported the job as cancelled.
    #[error("job {job_id} was cancelled by the remote service")]
    Cancelled { job_id: String },

    /// The polling deadline elapsed before the job reached a terminal state.
    #[error("job {job_id} timed out after {waited_secs}s without a terminal status")]
    Timeout { job_id: String, waited_secs: u64 },

    /// The polling scheduler stopped (shutdown or its orchestrator was
    /// dropped) while the job was still pending.
    #[error("job {job_id} abandoned: polling scheduler stopped before a terminal status")]
    SchedulerStopped { job_id: String },
}

impl FailureReason {
    /// Wrap a stage-level error as the task's failure reason.
    pub fn from_stage(stage: Stage, err: &PipelineError) -> Self {
        FailureReason::Stage {
            stage,
            detail: err.to_string(),
        }
    }

    /// True for [`FailureReason::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, FailureReason::Timeout { .. })
    }
}

/// Membership-upgrade eligibility violations.
///
/// Callers check eligibility before pricing; an ineligible upgrade has no
/// price at all rather than a price of zero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    /// A yearly membership cannot move to a monthly plan.
    #[error("Cannot switch from a yearly membership to a monthly plan")]
    YearlyToMonthly,

    /// Same billing period, but the target tier is not higher.
    #[error("Target plan level {target} is not higher than current level {current}")]
    LevelNotHigher { current: u32, target: u32 },

    /// A price was negative.
    #[error("Invalid price: {0}")]
    InvalidPrice(String),
}
