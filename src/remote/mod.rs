//! The remote job service contract.
//!
//! The pipeline only depends on [`RemoteJobClient`]; [`http::HttpJobClient`]
//! is the production implementation and tests substitute scripted fakes.
//!
//! ```text
//! issue_upload_credentials ─▶ upload_bytes ─▶ parse ─▶ submit_job ─▶ query_status …
//!      (task id + signed        (storage,     (word     (detect /     (batched,
//!       POST fields)             201 = ok)     count)    reduce)       polled)
//! ```

pub mod http;
pub mod status;

use crate::error::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub use status::{RemoteState, StatusTable, DETECTION_STATES, REDUCTION_STATES};

// ── Identifiers ──────────────────────────────────────────────────────────

/// Identifier the remote assigns to a document when upload credentials are issued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

/// Identifier of a detection or reduction job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

// ── Documents ────────────────────────────────────────────────────────────

/// Format of an uploaded document, as the parse endpoint understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Docx,
    Doc,
    Txt,
}

impl FileKind {
    /// Map a file extension (case-insensitive, without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileKind::Pdf),
            "docx" => Some(FileKind::Docx),
            "doc" => Some(FileKind::Doc),
            "txt" | "md" | "text" => Some(FileKind::Txt),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Doc => "doc",
            FileKind::Txt => "txt",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            FileKind::Pdf => "application/pdf",
            FileKind::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            FileKind::Doc => "application/msword",
            FileKind::Txt => "text/plain; charset=utf-8",
        }
    }
}

/// A document ready for upload.
#[derive(Debug, Clone)]
pub struct Document {
    /// File name sent to storage; also used for the upload signature.
    pub name: String,
    pub kind: FileKind,
    pub bytes: Vec<u8>,
}

impl Document {
    pub fn new(name: impl Into<String>, kind: FileKind, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            bytes,
        }
    }

    /// Wrap raw text as a plain-text document.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new("input.txt", FileKind::Txt, text.into().into_bytes())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

/// One-time destination and signed fields for a direct-to-storage upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTicket {
    pub task_id: TaskId,
    /// Storage endpoint that receives the multipart POST.
    pub host: String,
    /// Object key under which storage files the document.
    pub key: String,
    /// Signed form fields (policy, signature, access key, …), sent verbatim.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// What storage said about an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReceipt {
    pub status: u16,
    /// `status` equals the configured "created" code.
    pub accepted: bool,
}

/// The two downstream job services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// AI-content detection.
    Detect,
    /// Rewrite to reduce the detected AI share.
    Reduce,
}

impl JobKind {
    /// URL segment of the service's endpoints.
    pub fn path(self) -> &'static str {
        match self {
            JobKind::Detect => "detect",
            JobKind::Reduce => "reduce",
        }
    }

    /// State-code table of the service. The two services do not share a
    /// code space.
    pub fn status_table(self) -> &'static StatusTable {
        match self {
            JobKind::Detect => &DETECTION_STATES,
            JobKind::Reduce => &REDUCTION_STATES,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Caller-supplied metadata forwarded with a job submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Anything else the remote service accepts (language, rewrite mode, …).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Everything a submit call needs besides the caller's identity.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSubmission {
    pub task_id: TaskId,
    pub word_count: u64,
    pub metadata: JobMetadata,
}

/// One job's status as reported by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub job_id: JobId,
    /// Service-specific state code; classify it with [`JobKind::status_table`].
    pub state: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_url: Option<String>,
    /// AI-content share reported by detection, 0–100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Rewritten document produced by a reduction job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StatusRecord {
    /// A bare record with only an id and a state code.
    pub fn new(job_id: impl Into<String>, state: i64) -> Self {
        Self {
            job_id: JobId(job_id.into()),
            state,
            report_url: None,
            score: None,
            output_url: None,
            message: None,
            extra: serde_json::Map::new(),
        }
    }
}

// ── Contract ─────────────────────────────────────────────────────────────

/// The remote operations a pipeline needs. Every call is fallible.
///
/// The remote is assumed idempotent per task id, so callers may repeat a
/// call after an ambiguous failure.
#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    /// Obtain a task id plus a signed destination for a direct upload.
    async fn issue_upload_credentials(
        &self,
        document: &Document,
    ) -> Result<UploadTicket, PipelineError>;

    /// POST the document to storage. `Ok` means storage answered; check
    /// [`UploadReceipt::accepted`] for whether it took the object.
    async fn upload_bytes(
        &self,
        ticket: &UploadTicket,
        document: &Document,
    ) -> Result<UploadReceipt, PipelineError>;

    /// Convert the uploaded artifact into a word count.
    async fn parse(&self, task_id: &TaskId, kind: FileKind) -> Result<u64, PipelineError>;

    /// Start a detection or reduction job.
    async fn submit_job(
        &self,
        kind: JobKind,
        submission: &JobSubmission,
    ) -> Result<JobId, PipelineError>;

    /// Batched status query. Ids unknown to the remote are simply absent
    /// from the returned map.
    async fn query_status(
        &self,
        kind: JobKind,
        job_ids: &[JobId],
    ) -> Result<HashMap<JobId, StatusRecord>, PipelineError>;
}

#[async_trait]
impl<T: RemoteJobClient + ?Sized> RemoteJobClient for Arc<T> {
    async fn issue_upload_credentials(
        &self,
        document: &Document,
    ) -> Result<UploadTicket, PipelineError> {
        (**self).issue_upload_credentials(document).await
    }

    async fn upload_bytes(
        &self,
        ticket: &UploadTicket,
        document: &Document,
    ) -> Result<UploadReceipt, PipelineError> {
        (**self).upload_bytes(ticket, document).await
    }

    async fn parse(&self, task_id: &TaskId, kind: FileKind) -> Result<u64, PipelineError> {
        (**self).parse(task_id, kind).await
    }

    async fn submit_job(
        &self,
        kind: JobKind,
        submission: &JobSubmission,
    ) -> Result<JobId, PipelineError> {
        (**self).submit_job(kind, submission).await
    }

    async fn query_status(
        &self,
        kind: JobKind,
        job_ids: &[JobId],
    ) -> Result<HashMap<JobId, StatusRecord>, PipelineError> {
        (**self).query_status(kind, job_ids).await
    }
}
