//! Drives tasks through upload, parse and job submission, then hands them
//! to the polling schedulers.
//!
//! ## Flow
//!
//! ```text
//! start_upload ──▶ Uploading ──▶ Parsing ──▶ Detecting
//! submit_for_detection  ──▶ Polling            (detect-only)
//!                       └─▶ Reducing           (detect + reduce)
//! submit_for_reduction  ──▶ Polling
//! scheduler callback    ──▶ Completed | Failed
//! ```
//!
//! Every stage is entered only after the remote call that authorises it has
//! returned. A remote error at any stage moves the task straight to
//! `Failed`, with the error recorded as its result; the calling method still
//! returns normally so the caller reads the outcome from the task.
//! `Err(..)` is reserved for misuse such as submitting a task that is not in
//! the right stage.
//!
//! [`PipelineOrchestrator::process`] runs the whole chain in the
//! background and is what most callers want.

use crate::config::{PipelineConfig, SessionContext};
use crate::error::{FailureReason, PipelineError};
use crate::pipeline::poll::{
    JobOutcome, PollingScheduler, RemoteStatusSource, Resolution, SchedulerHandle,
};
use crate::pipeline::stage::{FlowKind, Stage};
use crate::pipeline::task::{Task, TaskArtifact, TaskHandle, Update};
use crate::remote::http::HttpJobClient;
use crate::remote::{Document, JobId, JobKind, JobMetadata, JobSubmission, RemoteJobClient};
use crate::stream::{observe, StageStream};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Inner {
    client: Arc<dyn RemoteJobClient>,
    session: SessionContext,
    config: PipelineConfig,
    detect: SchedulerHandle,
    reduce: SchedulerHandle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.detect.shutdown();
        self.reduce.shutdown();
    }
}

/// Entry point of the library: owns the remote client and one polling
/// scheduler per job service.
///
/// Cheap to clone; clones share the schedulers. Each job being polled holds
/// the schedulers alive, so dropping every clone still lets in-flight tasks
/// finish or time out. [`shutdown`](Self::shutdown) stops polling at once
/// and fails every task still in `Polling`.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

/// Map a stage-level error to the failure recorded on the task.
fn at(stage: Stage) -> impl Fn(PipelineError) -> FailureReason {
    move |err| FailureReason::from_stage(stage, &err)
}

impl PipelineOrchestrator {
    /// Build an orchestrator around any [`RemoteJobClient`].
    ///
    /// Spawns the detection and reduction schedulers, so this must be
    /// called from within a tokio runtime.
    pub fn new(
        client: Arc<dyn RemoteJobClient>,
        session: SessionContext,
        config: PipelineConfig,
    ) -> Self {
        let spawn_scheduler = |kind: JobKind| {
            PollingScheduler::new(
                kind.path(),
                RemoteStatusSource::new(Arc::clone(&client), kind),
                config.poll_interval(),
                config.poll_timeout(),
            )
            .spawn()
        };
        let detect = spawn_scheduler(JobKind::Detect);
        let reduce = spawn_scheduler(JobKind::Reduce);

        info!(user_id = %session.user_id, base_url = %config.base_url, "Pipeline orchestrator ready");
        Self {
            inner: Arc::new(Inner {
                client,
                session,
                config,
                detect,
                reduce,
            }),
        }
    }

    /// Build an orchestrator that talks HTTP to `config.base_url`.
    pub fn connect(config: PipelineConfig, session: SessionContext) -> Result<Self, PipelineError> {
        let client = HttpJobClient::new(&config, session.clone())?;
        Ok(Self::new(Arc::new(client), session, config))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &SessionContext {
        &self.inner.session
    }

    /// Stop both schedulers. Tasks still in `Polling` fail with
    /// [`FailureReason::SchedulerStopped`].
    pub fn shutdown(&self) {
        self.inner.detect.shutdown();
        self.inner.reduce.shutdown();
    }

    /// A new task in `Idle`, with the configured observer (if any) already
    /// subscribed.
    pub fn create_task(&self, document: &Document, flow: FlowKind) -> TaskHandle {
        let task = TaskHandle::new(document, flow);
        if let Some(observer) = &self.inner.config.observer {
            task.subscribe(Arc::clone(observer));
        }
        task
    }

    /// Follow a task's transitions as a stream.
    pub fn observe(&self, task: &TaskHandle) -> StageStream {
        observe(task)
    }

    // ── Stage drivers ────────────────────────────────────────────────────

    /// Create a task and drive it through upload and parse.
    ///
    /// The returned task is in `Detecting` on success and `Failed`
    /// otherwise.
    pub async fn start_upload(&self, document: Document, flow: FlowKind) -> TaskHandle {
        let task = self.create_task(&document, flow);
        self.upload_and_parse(&task, &document).await;
        task
    }

    async fn upload_and_parse(&self, task: &TaskHandle, document: &Document) {
        info!(
            "Starting upload: {} ({} bytes, {})",
            document.name,
            document.len(),
            document.kind.extension()
        );
        if let Err(reason) = self.try_upload_and_parse(task, document).await {
            self.fail(task, reason);
        }
    }

    async fn try_upload_and_parse(
        &self,
        task: &TaskHandle,
        document: &Document,
    ) -> Result<(), FailureReason> {
        let client = &self.inner.client;

        // ── Upload ───────────────────────────────────────────────────────
        task.advance(Stage::Uploading, Update::Nothing)
            .map_err(at(Stage::Uploading))?;
        self.check_size(document).map_err(at(Stage::Uploading))?;

        let ticket = client
            .issue_upload_credentials(document)
            .await
            .map_err(at(Stage::Uploading))?;
        task.assign_task_id(ticket.task_id.clone())
            .map_err(at(Stage::Uploading))?;
        debug!(task_id = %ticket.task_id, host = %ticket.host, "Upload credentials issued");

        let receipt = client
            .upload_bytes(&ticket, document)
            .await
            .map_err(at(Stage::Uploading))?;
        if !receipt.accepted {
            return Err(FailureReason::UploadRejected {
                status: receipt.status,
            });
        }

        // ── Parse ────────────────────────────────────────────────────────
        task.advance(Stage::Parsing, Update::Nothing)
            .map_err(at(Stage::Parsing))?;
        let word_count = client
            .parse(&ticket.task_id, document.kind)
            .await
            .map_err(at(Stage::Parsing))?;
        info!(task_id = %ticket.task_id, word_count, "Document parsed");

        task.advance(Stage::Detecting, Update::WordCount(word_count))
            .map_err(at(Stage::Parsing))?;
        Ok(())
    }

    fn check_size(&self, document: &Document) -> Result<(), PipelineError> {
        let limit = self.inner.config.max_upload_bytes;
        if document.is_empty() {
            return Err(PipelineError::InvalidInput {
                input: document.name.clone(),
                reason: "document is empty".into(),
            });
        }
        if document.len() > limit {
            return Err(PipelineError::InvalidInput {
                input: document.name.clone(),
                reason: format!(
                    "{} bytes exceeds the upload limit of {} bytes",
                    document.len(),
                    limit
                ),
            });
        }
        Ok(())
    }

    /// Submit the detection job of a task in `Detecting`.
    ///
    /// Detect-only tasks move to `Polling` and are watched by the detection
    /// scheduler; detect+reduce tasks move to `Reducing`. On a finished
    /// task this does nothing and returns its final record.
    pub async fn submit_for_detection(
        &self,
        task: &TaskHandle,
        metadata: JobMetadata,
    ) -> Result<Task, PipelineError> {
        self.submit(task, JobKind::Detect, metadata).await
    }

    /// Submit the reduction job of a detect+reduce task in `Reducing`, then
    /// watch it. On a finished task this does nothing and returns its final
    /// record.
    pub async fn submit_for_reduction(
        &self,
        task: &TaskHandle,
        metadata: JobMetadata,
    ) -> Result<Task, PipelineError> {
        self.submit(task, JobKind::Reduce, metadata).await
    }

    async fn submit(
        &self,
        task: &TaskHandle,
        kind: JobKind,
        metadata: JobMetadata,
    ) -> Result<Task, PipelineError> {
        // One submission per task at a time; the stage is read under the
        // claim so a second caller sees the stage the first one reached.
        let Some(_claim) = task.claim_submission() else {
            return Err(PipelineError::SubmissionInProgress);
        };
        let snapshot = task.snapshot();
        if snapshot.stage.is_terminal() {
            debug!(stage = %snapshot.stage, "Task already finished; replaying result");
            return Ok(snapshot);
        }

        let stage = match kind {
            JobKind::Detect => Stage::Detecting,
            JobKind::Reduce => Stage::Reducing,
        };
        if snapshot.stage != stage {
            return Err(PipelineError::InvalidTransition {
                from: snapshot.stage,
                to: stage.next(snapshot.flow).unwrap_or(Stage::Polling),
            });
        }

        let task_id = snapshot.task_id.ok_or(PipelineError::MissingTaskId)?;
        let word_count = snapshot
            .word_count
            .ok_or_else(|| PipelineError::Internal("word count missing after parse".into()))?;
        let submission = JobSubmission {
            task_id,
            word_count,
            metadata,
        };

        let job_id = match self.inner.client.submit_job(kind, &submission).await {
            Ok(id) => id,
            Err(e) => {
                self.fail(task, FailureReason::from_stage(stage, &e));
                return Ok(task.snapshot());
            }
        };
        info!(task_id = %submission.task_id, %job_id, "Submitted {} job", kind);

        let next = stage.next(snapshot.flow).unwrap_or(Stage::Polling);
        task.advance(next, Update::Job(kind, job_id.clone()))?;
        if next == Stage::Polling {
            self.watch(task, kind, job_id, word_count);
        }
        Ok(task.snapshot())
    }

    fn watch(&self, task: &TaskHandle, kind: JobKind, job_id: JobId, word_count: u64) {
        let scheduler = match kind {
            JobKind::Detect => &self.inner.detect,
            JobKind::Reduce => &self.inner.reduce,
        };
        let handle = task.clone();
        // The orchestrator stays alive until the job resolves, so dropping
        // the caller's copy does not abandon tasks that are still polling.
        let keep_alive = Arc::clone(&self.inner);
        let on_resolved = Box::new(move |resolution: Resolution| {
            let result = match resolution.outcome {
                JobOutcome::Completed(record) => {
                    handle.complete(TaskArtifact::from_record(kind, word_count, record))
                }
                JobOutcome::Failed(reason) => handle.fail(reason),
            };
            if let Err(e) = result {
                warn!(job_id = %resolution.job_id, error = %e, "Dropping resolution for finished task");
            }
            drop(keep_alive);
        });

        if let Err(e) = scheduler.watch(job_id, on_resolved) {
            self.fail(task, FailureReason::from_stage(Stage::Polling, &e));
        }
    }

    fn fail(&self, task: &TaskHandle, reason: FailureReason) {
        warn!(
            task_id = %task.task_id().map(|t| t.0).unwrap_or_default(),
            %reason,
            "Task failed"
        );
        if let Err(e) = task.fail(reason) {
            debug!(error = %e, "Task was already finished");
        }
    }

    // ── Whole-chain conveniences ─────────────────────────────────────────

    /// Run the full chain for `document` in the background.
    ///
    /// Returns at once with the task in `Idle`; subscribe, observe or
    /// [`wait`](TaskHandle::wait) on it.
    pub fn process(&self, document: Document, flow: FlowKind, metadata: JobMetadata) -> TaskHandle {
        let task = self.create_task(&document, flow);
        let this = self.clone();
        let handle = task.clone();
        tokio::spawn(async move {
            this.drive(&handle, document, metadata).await;
        });
        task
    }

    /// [`process`](Self::process) and wait for the final record.
    pub async fn run_to_completion(
        &self,
        document: Document,
        flow: FlowKind,
        metadata: JobMetadata,
    ) -> Task {
        self.process(document, flow, metadata).wait().await
    }

    async fn drive(&self, task: &TaskHandle, document: Document, metadata: JobMetadata) {
        self.upload_and_parse(task, &document).await;

        if task.current_stage() == Stage::Detecting {
            if let Err(e) = self.submit_for_detection(task, metadata.clone()).await {
                self.fail(task, FailureReason::from_stage(Stage::Detecting, &e));
            }
        }
        if task.current_stage() == Stage::Reducing {
            if let Err(e) = self.submit_for_reduction(task, metadata).await {
                self.fail(task, FailureReason::from_stage(Stage::Reducing, &e));
            }
        }
    }
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("session", &self.inner.session)
            .field("config", &self.inner.config)
            .field("detect", &self.inner.detect)
            .field("reduce", &self.inner.reduce)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::task::TaskResult;
    use crate::remote::{FileKind, StatusRecord, TaskId, UploadReceipt, UploadTicket};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Accepts everything; counts calls.
    #[derive(Default)]
    struct Fake {
        calls: Mutex<Vec<&'static str>>,
        fail_submit: bool,
        /// Jobs report "running" forever.
        never_finish: bool,
        submit_delay: Option<Duration>,
    }

    impl Fake {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteJobClient for Fake {
        async fn issue_upload_credentials(
            &self,
            _document: &Document,
        ) -> Result<UploadTicket, PipelineError> {
            self.calls.lock().unwrap().push("credentials");
            Ok(UploadTicket {
                task_id: TaskId::from("t1"),
                host: "http://storage".into(),
                key: "k".into(),
                fields: BTreeMap::new(),
            })
        }

        async fn upload_bytes(
            &self,
            _ticket: &UploadTicket,
            _document: &Document,
        ) -> Result<UploadReceipt, PipelineError> {
            self.calls.lock().unwrap().push("upload");
            Ok(UploadReceipt {
                status: 201,
                accepted: true,
            })
        }

        async fn parse(&self, _task_id: &TaskId, _kind: FileKind) -> Result<u64, PipelineError> {
            self.calls.lock().unwrap().push("parse");
            Ok(42)
        }

        async fn submit_job(
            &self,
            _kind: JobKind,
            _submission: &JobSubmission,
        ) -> Result<JobId, PipelineError> {
            self.calls.lock().unwrap().push("submit");
            if let Some(delay) = self.submit_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_submit {
                return Err(PipelineError::transport("submit", "connection refused"));
            }
            Ok(JobId::from("d1"))
        }

        async fn query_status(
            &self,
            _kind: JobKind,
            job_ids: &[JobId],
        ) -> Result<HashMap<JobId, StatusRecord>, PipelineError> {
            let state = if self.never_finish { 1 } else { 3 };
            Ok(job_ids
                .iter()
                .map(|id| (id.clone(), StatusRecord::new(id.0.clone(), state)))
                .collect())
        }
    }

    fn orchestrator(fake: Arc<Fake>, max_upload_bytes: usize) -> PipelineOrchestrator {
        let config = PipelineConfig::builder()
            .max_upload_bytes(max_upload_bytes)
            .poll_interval_ms(1_000)
            .poll_timeout_secs(30)
            .build()
            .unwrap();
        PipelineOrchestrator::new(fake, SessionContext::with_static_token("u1", None), config)
    }

    #[tokio::test]
    async fn oversized_document_fails_before_network() {
        let fake = Arc::new(Fake::default());
        let orch = orchestrator(fake.clone(), 4);
        let task = orch
            .start_upload(Document::from_text("too long"), FlowKind::DetectOnly)
            .await;

        let snap = task.snapshot();
        assert_eq!(snap.stage, Stage::Failed);
        let history: Vec<Stage> = task.history().iter().map(|e| e.stage).collect();
        assert_eq!(history, vec![Stage::Uploading, Stage::Failed]);
        assert!(fake.calls().is_empty());
        let reason = task.history()[1].failure().unwrap().to_string();
        assert!(reason.contains("upload limit"), "{reason}");
    }

    #[tokio::test]
    async fn submitting_in_wrong_stage_is_an_error() {
        let fake = Arc::new(Fake::default());
        let orch = orchestrator(fake.clone(), 1024);
        let task = orch.create_task(&Document::from_text("hi"), FlowKind::DetectOnly);
        let err = orch
            .submit_for_detection(&task, JobMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { from: Stage::Idle, .. }));
        assert_eq!(task.current_stage(), Stage::Idle);
        assert!(fake.calls().is_empty());

        let task = orch
            .start_upload(Document::from_text("hi"), FlowKind::DetectOnly)
            .await;
        assert!(orch
            .submit_for_reduction(&task, JobMetadata::default())
            .await
            .is_err());
        assert_eq!(task.current_stage(), Stage::Detecting);
    }

    #[tokio::test]
    async fn submit_failure_fails_the_task() {
        let fake = Arc::new(Fake {
            fail_submit: true,
            ..Default::default()
        });
        let orch = orchestrator(fake.clone(), 1024);
        let task = orch
            .start_upload(Document::from_text("hi"), FlowKind::DetectOnly)
            .await;
        let snap = orch
            .submit_for_detection(&task, JobMetadata::default())
            .await
            .unwrap();
        assert_eq!(snap.stage, Stage::Failed);
        assert_eq!(snap.word_count, Some(42));
        assert!(snap.detection_job_id.is_none());
    }

    #[tokio::test]
    async fn finished_task_replays_instead_of_resubmitting() {
        let fake = Arc::new(Fake::default());
        let orch = orchestrator(fake.clone(), 1024);
        let task = orch.process(
            Document::from_text("hello"),
            FlowKind::DetectOnly,
            JobMetadata::default(),
        );
        let done = task.wait().await;
        assert_eq!(done.stage, Stage::Completed);

        let again = orch
            .submit_for_detection(&task, JobMetadata::default())
            .await
            .unwrap();
        assert_eq!(again, done);
        let submits = fake.calls().iter().filter(|c| **c == "submit").count();
        assert_eq!(submits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_orchestrator_still_finishes_polling_tasks() {
        let fake = Arc::new(Fake::default());
        let task = {
            let orch = orchestrator(fake.clone(), 1024);
            orch.process(
                Document::from_text("hello"),
                FlowKind::DetectOnly,
                JobMetadata::default(),
            )
        };
        let done = task.wait().await;
        assert_eq!(done.stage, Stage::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_orchestrator_still_times_out_stuck_jobs() {
        let fake = Arc::new(Fake {
            never_finish: true,
            ..Default::default()
        });
        let task = {
            let orch = orchestrator(fake.clone(), 1024);
            orch.process(
                Document::from_text("hello"),
                FlowKind::DetectOnly,
                JobMetadata::default(),
            )
        };
        let done = tokio::time::timeout(Duration::from_secs(120), task.wait())
            .await
            .expect("task reaches a terminal stage");
        assert_eq!(done.stage, Stage::Failed);
        let Some(TaskResult::Failure { reason }) = done.result else {
            panic!("expected failure");
        };
        assert!(reason.is_timeout(), "{reason}");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_tasks_still_polling() {
        let fake = Arc::new(Fake {
            never_finish: true,
            ..Default::default()
        });
        let orch = orchestrator(fake.clone(), 1024);
        let task = orch
            .start_upload(Document::from_text("hello"), FlowKind::DetectOnly)
            .await;
        let snap = orch
            .submit_for_detection(&task, JobMetadata::default())
            .await
            .unwrap();
        assert_eq!(snap.stage, Stage::Polling);
        tokio::time::sleep(Duration::from_secs(5)).await;

        orch.shutdown();
        let done = tokio::time::timeout(Duration::from_secs(5), task.wait())
            .await
            .expect("shutdown resolves the task");
        assert_eq!(done.stage, Stage::Failed);
        assert!(matches!(
            done.result,
            Some(TaskResult::Failure {
                reason: FailureReason::SchedulerStopped { .. }
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_submits_send_one_job() {
        let fake = Arc::new(Fake {
            submit_delay: Some(Duration::from_secs(1)),
            never_finish: true,
            ..Default::default()
        });
        let orch = orchestrator(fake.clone(), 1024);
        let task = orch
            .start_upload(Document::from_text("hello"), FlowKind::DetectOnly)
            .await;

        let (first, second) = tokio::join!(
            orch.submit_for_detection(&task, JobMetadata::default()),
            orch.submit_for_detection(&task, JobMetadata::default()),
        );
        assert_eq!(first.unwrap().stage, Stage::Polling);
        assert!(matches!(second, Err(PipelineError::SubmissionInProgress)));
        let submits = fake.calls().iter().filter(|c| **c == "submit").count();
        assert_eq!(submits, 1);

        // Once the first submission is done, a retry sees the new stage.
        assert!(matches!(
            orch.submit_for_detection(&task, JobMetadata::default()).await,
            Err(PipelineError::InvalidTransition { from: Stage::Polling, .. })
        ));
    }
}
