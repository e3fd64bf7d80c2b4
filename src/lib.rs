//! # paperflow
//!
//! Drive documents through a remote processing service: signed upload,
//! parsing into a word count, AI-content detection and optional rewriting,
//! then polling until the remote reports a result.
//!
//! ## Why this crate?
//!
//! Every document goes through the same chain of remote calls, but each
//! call can fail, the final jobs take minutes, and the UI that shows
//! progress must never see a stage twice or out of order. This crate keeps
//! one explicit state machine per task, one batched poller per remote
//! service, and reports each transition exactly once to whoever subscribed.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Document
//!  │
//!  ├─ 1. Uploading   upload credentials + multipart POST to storage
//!  ├─ 2. Parsing     remote word count
//!  ├─ 3. Detecting   submit the detection job
//!  ├─ 4. Reducing    submit the rewrite job (detect + reduce flow only)
//!  ├─ 5. Polling     batched status queries until a terminal state or timeout
//!  └─ 6. Completed | Failed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use paperflow::{
//!     Document, FlowKind, JobMetadata, PipelineConfig, PipelineOrchestrator, SessionContext,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .base_url("https://api.example.com")
//!         .build()?;
//!     let session = SessionContext::with_static_token("user-1", Some("token".into()));
//!     let orchestrator = PipelineOrchestrator::connect(config, session)?;
//!
//!     let task = orchestrator.run_to_completion(
//!         Document::from_text("Some essay text"),
//!         FlowKind::DetectOnly,
//!         JobMetadata::default(),
//!     ).await;
//!     println!("{}", serde_json::to_string_pretty(&task)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `paperflow` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! paperflow = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod pricing;
pub mod progress;
pub mod remote;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder, SessionContext, StaticToken, TokenSource};
pub use error::{FailureReason, PipelineError, UpgradeError};
pub use orchestrator::PipelineOrchestrator;
pub use pipeline::input::resolve_document;
pub use pipeline::poll::{
    JobOutcome, PollSet, PollingScheduler, RemoteStatusSource, Resolution, SchedulerHandle,
    StatusSource, TickReport,
};
pub use pipeline::stage::{FlowKind, Stage};
pub use pipeline::task::{
    StageEvent, SubscriptionId, Task, TaskArtifact, TaskHandle, TaskResult, TaskSnapshot,
};
pub use pricing::{check_eligibility, upgrade_price, MembershipState, Money, PeriodType, Plan};
pub use progress::{NoopObserver, ObserverRef, StageObserver};
pub use remote::http::HttpJobClient;
pub use remote::{
    Document, FileKind, JobId, JobKind, JobMetadata, JobSubmission, RemoteJobClient, RemoteState,
    StatusRecord, StatusTable, TaskId, UploadReceipt, UploadTicket, DETECTION_STATES,
    REDUCTION_STATES,
};
pub use stream::{observe, observe_all, EventStream, StageStream};
