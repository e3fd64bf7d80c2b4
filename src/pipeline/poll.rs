//! Polling scheduler: repeat batched status queries until every watched
//! job is resolved or its deadline passes.
//!
//! ## Shape
//!
//! * [`PollSet`] is the synchronous core: the `pending` jobs, each with a
//!   deadline and a one-shot resolution callback. Resolving or expiring a
//!   job removes it and consumes its callback, so a job can never be
//!   reported twice.
//! * [`PollingScheduler`] owns a `PollSet` plus a [`StatusSource`] and
//!   knows how to run one [`tick`](PollingScheduler::tick).
//! * [`PollingScheduler::run_until_idle`] drives a fixed set of jobs to
//!   completion; [`PollingScheduler::spawn`] turns the scheduler into a
//!   background service that accepts new jobs through a [`SchedulerHandle`].
//!
//! ## Timing
//!
//! All deadlines use `tokio::time::Instant`, which is monotonic and follows
//! tokio's paused test clock. Ticks come from `tokio::time::interval` with
//! [`MissedTickBehavior::Skip`]: the loop awaits each query before the next
//! tick, so at most one query is in flight and ticks missed while a slow
//! query runs are dropped rather than replayed in a burst. A query is also
//! cut off at the earliest pending deadline, so a hung remote cannot push
//! a timeout back by more than one tick.

use crate::error::{FailureReason, PipelineError};
use crate::remote::{JobId, JobKind, RemoteJobClient, RemoteState, StatusRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ── Status source ────────────────────────────────────────────────────────

/// Where the scheduler gets job states from, and how it reads them.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    /// One batched query. Ids missing from the answer are still pending.
    async fn query(
        &self,
        job_ids: &[JobId],
    ) -> Result<HashMap<JobId, StatusRecord>, PipelineError>;

    /// Map a record's service-specific code to a [`RemoteState`].
    fn classify(&self, record: &StatusRecord) -> RemoteState;
}

/// Status source backed by a [`RemoteJobClient`] endpoint.
pub struct RemoteStatusSource {
    client: Arc<dyn RemoteJobClient>,
    kind: JobKind,
}

impl RemoteStatusSource {
    pub fn new(client: Arc<dyn RemoteJobClient>, kind: JobKind) -> Self {
        Self { client, kind }
    }
}

#[async_trait]
impl StatusSource for RemoteStatusSource {
    async fn query(
        &self,
        job_ids: &[JobId],
    ) -> Result<HashMap<JobId, StatusRecord>, PipelineError> {
        self.client.query_status(self.kind, job_ids).await
    }

    fn classify(&self, record: &StatusRecord) -> RemoteState {
        self.kind.status_table().classify(record.state)
    }
}

// ── Resolutions ──────────────────────────────────────────────────────────

/// How a watched job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The remote reported success; carries the full status record.
    Completed(StatusRecord),
    /// Remote failure, remote cancellation or timeout.
    Failed(FailureReason),
}

/// Delivered exactly once per watched job.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

impl Resolution {
    fn stopped(job_id: JobId) -> Self {
        let reason = FailureReason::SchedulerStopped {
            job_id: job_id.to_string(),
        };
        Resolution {
            job_id,
            outcome: JobOutcome::Failed(reason),
        }
    }
}

/// One-shot callback fired when a job resolves.
pub type ResolutionCallback = Box<dyn FnOnce(Resolution) + Send + 'static>;

// ── PollSet ──────────────────────────────────────────────────────────────

struct PendingJob {
    deadline: Instant,
    watched_since: Instant,
    on_resolved: ResolutionCallback,
}

/// The jobs still awaiting a terminal remote status.
///
/// Every id in the set has not yet been resolved; ids are unique.
#[derive(Default)]
pub struct PollSet {
    pending: HashMap<JobId, PendingJob>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `job_id`. Returns `false` (dropping `on_resolved`
    /// uncalled) if the id is already pending.
    pub fn insert(
        &mut self,
        job_id: JobId,
        deadline: Instant,
        now: Instant,
        on_resolved: ResolutionCallback,
    ) -> bool {
        if self.pending.contains_key(&job_id) {
            return false;
        }
        self.pending.insert(
            job_id,
            PendingJob {
                deadline,
                watched_since: now,
                on_resolved,
            },
        );
        true
    }

    /// Stop watching without firing the callback.
    pub fn remove(&mut self, job_id: &JobId) -> bool {
        self.pending.remove(job_id).is_some()
    }

    /// Remove `job_id` and fire its callback. Returns `false` if the id was
    /// not pending.
    pub fn resolve(&mut self, job_id: &JobId, outcome: JobOutcome) -> bool {
        match self.pending.remove(job_id) {
            Some(job) => {
                (job.on_resolved)(Resolution {
                    job_id: job_id.clone(),
                    outcome,
                });
                true
            }
            None => false,
        }
    }

    /// Fail every job whose deadline is at or before `now` with a timeout.
    /// Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let overdue: Vec<JobId> = self
            .pending
            .iter()
            .filter(|(_, job)| job.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in &overdue {
            if let Some(job) = self.pending.remove(job_id) {
                let waited = now.saturating_duration_since(job.watched_since);
                warn!(%job_id, waited_secs = waited.as_secs(), "Polling deadline elapsed");
                (job.on_resolved)(Resolution {
                    job_id: job_id.clone(),
                    outcome: JobOutcome::Failed(FailureReason::Timeout {
                        job_id: job_id.to_string(),
                        waited_secs: waited.as_secs(),
                    }),
                });
            }
        }
        overdue.len()
    }

    /// Fail every pending job because the scheduler is stopping. Returns
    /// how many were pending.
    pub fn abandon_all(&mut self) -> usize {
        let abandoned = self.ids();
        for job_id in &abandoned {
            if let Some(job) = self.pending.remove(job_id) {
                (job.on_resolved)(Resolution::stopped(job_id.clone()));
            }
        }
        abandoned.len()
    }

    /// Pending ids in a stable order.
    pub fn ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.pending.contains_key(job_id)
    }

    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|job| job.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl fmt::Debug for PollSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollSet")
            .field("pending", &self.ids())
            .finish()
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Ids sent in the status query (0 when nothing was pending).
    pub queried: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// The status query errored; ids stay pending for the next tick.
    pub query_failed: bool,
}

/// Polls a [`StatusSource`] for the jobs in its [`PollSet`].
pub struct PollingScheduler<S: StatusSource> {
    name: String,
    source: S,
    set: PollSet,
    interval: Duration,
    timeout: Duration,
}

impl<S: StatusSource> PollingScheduler<S> {
    /// `timeout` is each job's deadline, measured from when it is watched.
    pub fn new(name: impl Into<String>, source: S, interval: Duration, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            source,
            set: PollSet::new(),
            interval,
            timeout,
        }
    }

    /// Watch `job_id` with the scheduler's default timeout.
    pub fn watch(&mut self, job_id: JobId, on_resolved: ResolutionCallback) -> bool {
        let now = Instant::now();
        self.watch_until(job_id, now + self.timeout, on_resolved)
    }

    /// Watch `job_id` until an explicit deadline.
    pub fn watch_until(
        &mut self,
        job_id: JobId,
        deadline: Instant,
        on_resolved: ResolutionCallback,
    ) -> bool {
        let added = self.set.insert(job_id.clone(), deadline, Instant::now(), on_resolved);
        if added {
            debug!(scheduler = %self.name, %job_id, "Watching job");
        } else {
            warn!(scheduler = %self.name, %job_id, "Job already watched; ignoring duplicate");
        }
        added
    }

    /// Stop watching `job_id` without a callback.
    pub fn cancel(&mut self, job_id: &JobId) -> bool {
        self.set.remove(job_id)
    }

    /// Read-only view of the pending jobs.
    pub fn pending(&self) -> &PollSet {
        &self.set
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Query the remote once for every pending job and resolve what has
    /// finished. Overdue jobs are expired before and after the query.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport {
            timed_out: self.set.expire(Instant::now()),
            ..Default::default()
        };

        let Some(deadline) = self.set.earliest_deadline() else {
            return report;
        };
        let ids = self.set.ids();
        report.queried = ids.len();

        match timeout_at(deadline, self.source.query(&ids)).await {
            Err(_) => {
                debug!(scheduler = %self.name, "Status query cut off at deadline");
            }
            Ok(Err(e)) => {
                report.query_failed = true;
                if e.is_transient() {
                    warn!(scheduler = %self.name, pending = ids.len(), error = %e,
                        "Status query failed; retrying next tick");
                } else {
                    error!(scheduler = %self.name, pending = ids.len(), error = %e,
                        "Status query rejected; retrying next tick");
                }
            }
            Ok(Ok(records)) => {
                for job_id in &ids {
                    let Some(record) = records.get(job_id) else {
                        continue;
                    };
                    match self.source.classify(record) {
                        RemoteState::Completed => {
                            info!(scheduler = %self.name, %job_id, "Job completed");
                            self.set
                                .resolve(job_id, JobOutcome::Completed(record.clone()));
                            report.completed += 1;
                        }
                        RemoteState::Failed => {
                            let message = record
                                .message
                                .clone()
                                .filter(|m| !m.trim().is_empty())
                                .unwrap_or_else(|| format!("remote state {}", record.state));
                            warn!(scheduler = %self.name, %job_id, %message, "Job failed remotely");
                            self.set.resolve(
                                job_id,
                                JobOutcome::Failed(FailureReason::RemoteFailure {
                                    job_id: job_id.to_string(),
                                    message,
                                }),
                            );
                            report.failed += 1;
                        }
                        RemoteState::Cancelled => {
                            warn!(scheduler = %self.name, %job_id, "Job cancelled remotely");
                            self.set.resolve(
                                job_id,
                                JobOutcome::Failed(FailureReason::Cancelled {
                                    job_id: job_id.to_string(),
                                }),
                            );
                            report.failed += 1;
                        }
                        RemoteState::Unknown(code) => {
                            warn!(scheduler = %self.name, %job_id, code, "Unknown remote state code");
                        }
                        RemoteState::Queued | RemoteState::Running => {}
                    }
                }
            }
        }

        report.timed_out += self.set.expire(Instant::now());
        debug!(scheduler = %self.name, ?report, remaining = self.set.len(), "Tick done");
        report
    }

    /// Poll until every watched job has been resolved or has timed out.
    pub async fn run_until_idle(&mut self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while let Some(deadline) = self.set.earliest_deadline() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = sleep_until(deadline) => {
                    self.set.expire(Instant::now());
                }
            }
        }
    }

    /// Move the scheduler onto a background task.
    ///
    /// The loop keeps running while idle and stops on
    /// [`SchedulerHandle::shutdown`] or once every handle is dropped.
    /// Jobs still pending at that point are resolved as
    /// [`FailureReason::SchedulerStopped`].
    pub fn spawn(self) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let name = self.name.clone();
        tokio::spawn(self.serve(rx, cancel.clone()));
        SchedulerHandle { name, tx, cancel }
    }

    async fn serve(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        info!(scheduler = %self.name, interval_ms = self.interval.as_millis() as u64, "Polling scheduler started");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let next_deadline = self.set.earliest_deadline();
            let idle = self.set.is_empty();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Watch { job_id, on_resolved }) => {
                        self.watch(job_id, on_resolved);
                    }
                    Some(Command::Cancel { job_id }) => {
                        if self.cancel(&job_id) {
                            debug!(scheduler = %self.name, %job_id, "Stopped watching job");
                        }
                    }
                    None => break,
                },
                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    self.set.expire(Instant::now());
                }
                _ = ticker.tick(), if !idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.tick() => {}
                    }
                }
            }
        }

        // Watches queued behind the stop signal are failed along with the
        // pending set.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Watch { job_id, on_resolved } = command {
                on_resolved(Resolution::stopped(job_id));
            }
        }
        let abandoned = self.set.abandon_all();
        if abandoned > 0 {
            warn!(scheduler = %self.name, abandoned, "Scheduler stopped with jobs still pending; failing them");
        }
        info!(scheduler = %self.name, "Polling scheduler stopped");
    }
}

enum Command {
    Watch {
        job_id: JobId,
        on_resolved: ResolutionCallback,
    },
    Cancel {
        job_id: JobId,
    },
}

/// Cloneable front end of a spawned [`PollingScheduler`].
///
/// Callers may add jobs or cancel them; the pending set itself is only
/// touched by the scheduler's own loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    name: String,
    tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Start watching `job_id`. `on_resolved` fires exactly once, from the
    /// scheduler's task; a shutdown before the job finishes resolves it as
    /// [`FailureReason::SchedulerStopped`].
    pub fn watch(&self, job_id: JobId, on_resolved: ResolutionCallback) -> Result<(), PipelineError> {
        self.tx
            .send(Command::Watch { job_id, on_resolved })
            .map_err(|_| PipelineError::SchedulerClosed)
    }

    /// Stop watching `job_id`; its callback will not fire.
    pub fn cancel(&self, job_id: JobId) -> Result<(), PipelineError> {
        self.tx
            .send(Command::Cancel { job_id })
            .map_err(|_| PipelineError::SchedulerClosed)
    }

    /// Stop the loop. Pending jobs are failed with
    /// [`FailureReason::SchedulerStopped`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the loop has exited.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::DETECTION_STATES;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    const RUNNING: i64 = 1;
    const COMPLETED: i64 = 3;
    const FAILED: i64 = -1;

    /// Reports each job as running until it has been queried
    /// `resolve_after[id]` times, then as `final_state[id]`.
    #[derive(Default)]
    struct ScriptedSource {
        resolve_after: HashMap<JobId, usize>,
        final_state: HashMap<JobId, i64>,
        seen: Mutex<HashMap<JobId, usize>>,
        queries: Arc<Mutex<Vec<Vec<JobId>>>>,
        failing_queries: HashSet<usize>,
        query_delay: Option<Duration>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn job(mut self, id: &str, after: usize, state: i64) -> Self {
            self.resolve_after.insert(JobId::from(id), after);
            self.final_state.insert(JobId::from(id), state);
            self
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn query(
            &self,
            job_ids: &[JobId],
        ) -> Result<HashMap<JobId, StatusRecord>, PipelineError> {
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
            let query_no = {
                let mut queries = self.queries.lock().unwrap();
                queries.push(job_ids.to_vec());
                queries.len()
            };
            if let Some(delay) = self.query_delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing_queries.contains(&query_no) {
                return Err(PipelineError::transport("status", "connection reset"));
            }

            let mut seen = self.seen.lock().unwrap();
            let mut out = HashMap::new();
            for id in job_ids {
                let Some(after) = self.resolve_after.get(id) else {
                    continue;
                };
                let count = seen.entry(id.clone()).or_insert(0);
                *count += 1;
                let state = if *count >= *after {
                    self.final_state[id]
                } else {
                    RUNNING
                };
                out.insert(id.clone(), StatusRecord::new(id.0.clone(), state));
            }
            Ok(out)
        }

        fn classify(&self, record: &StatusRecord) -> RemoteState {
            DETECTION_STATES.classify(record.state)
        }
    }

    fn collector() -> (Arc<Mutex<Vec<Resolution>>>, impl Fn() -> ResolutionCallback) {
        let store = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&store);
        let make = move || -> ResolutionCallback {
            let s = Arc::clone(&s);
            Box::new(move |r| s.lock().unwrap().push(r))
        };
        (store, make)
    }

    #[test]
    fn poll_set_deduplicates() {
        let now = Instant::now();
        let mut set = PollSet::new();
        assert!(set.insert(JobId::from("a"), now, now, Box::new(|_| {})));
        assert!(!set.insert(JobId::from("a"), now, now, Box::new(|_| panic!("dropped"))));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn resolve_fires_once() {
        let now = Instant::now();
        let (store, cb) = collector();
        let mut set = PollSet::new();
        set.insert(JobId::from("a"), now + Duration::from_secs(5), now, cb());
        let record = StatusRecord::new("a", COMPLETED);
        assert!(set.resolve(&JobId::from("a"), JobOutcome::Completed(record.clone())));
        assert!(!set.resolve(&JobId::from("a"), JobOutcome::Completed(record)));
        assert_eq!(store.lock().unwrap().len(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn expire_only_overdue() {
        let now = Instant::now();
        let (store, cb) = collector();
        let mut set = PollSet::new();
        set.insert(JobId::from("late"), now, now, cb());
        set.insert(JobId::from("fresh"), now + Duration::from_secs(60), now, cb());
        assert_eq!(set.expire(now), 1);
        assert_eq!(set.ids(), vec![JobId::from("fresh")]);
        let got = store.lock().unwrap();
        assert!(matches!(&got[0].outcome, JobOutcome::Failed(r) if r.is_timeout()));
    }

    #[tokio::test(start_paused = true)]
    async fn n_jobs_resolving_after_i_ticks_fire_n_callbacks() {
        let mut source = ScriptedSource::default();
        for i in 1..=5 {
            source = source.job(&format!("job-{i}"), i, COMPLETED);
        }
        let queries = Arc::clone(&source.queries);
        let (store, cb) = collector();

        let mut scheduler = PollingScheduler::new(
            "detect",
            source,
            Duration::from_secs(3),
            Duration::from_secs(600),
        );
        for i in 1..=5 {
            assert!(scheduler.watch(JobId(format!("job-{i}")), cb()));
        }
        scheduler.run_until_idle().await;

        let got = store.lock().unwrap();
        assert_eq!(got.len(), 5);
        let unique: HashSet<_> = got.iter().map(|r| r.job_id.clone()).collect();
        assert_eq!(unique.len(), 5);
        assert!(got.iter().all(|r| matches!(r.outcome, JobOutcome::Completed(_))));
        assert!(scheduler.pending().is_empty());

        // Resolved ids drop out of later queries.
        let sizes: Vec<usize> = queries.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn never_resolving_job_times_out_once() {
        let source = ScriptedSource::default().job("stuck", usize::MAX, COMPLETED);
        let queries = Arc::clone(&source.queries);
        let start = Instant::now();
        let fired_at = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired_at);

        let mut scheduler = PollingScheduler::new(
            "detect",
            source,
            Duration::from_secs(3),
            Duration::from_secs(10),
        );
        scheduler.watch(
            JobId::from("stuck"),
            Box::new(move |r| f.lock().unwrap().push((Instant::now(), r))),
        );
        scheduler.run_until_idle().await;

        let fired = fired_at.lock().unwrap();
        assert_eq!(fired.len(), 1);
        let (at, resolution) = &fired[0];
        let elapsed = at.duration_since(start);
        assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
        assert!(elapsed <= Duration::from_secs(13), "{elapsed:?}");
        assert!(matches!(&resolution.outcome, JobOutcome::Failed(r) if r.is_timeout()));

        // Queries at 0s, 3s, 6s, 9s; none after the deadline.
        assert_eq!(queries.lock().unwrap().len(), 4);
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_keep_jobs_pending() {
        let mut source = ScriptedSource::default().job("d1", 1, COMPLETED);
        source.failing_queries = [1, 2].into_iter().collect();
        let queries = Arc::clone(&source.queries);
        let (store, cb) = collector();

        let mut scheduler =
            PollingScheduler::new("detect", source, Duration::from_secs(3), Duration::from_secs(60));
        scheduler.watch(JobId::from("d1"), cb());

        let first = scheduler.tick().await;
        assert!(first.query_failed);
        assert!(scheduler.pending().contains(&JobId::from("d1")));
        assert!(store.lock().unwrap().is_empty());

        scheduler.run_until_idle().await;
        let got = store.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0].outcome, JobOutcome::Completed(_)));
        assert_eq!(queries.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_does_not_affect_other_jobs() {
        let source = ScriptedSource::default()
            .job("bad", 1, FAILED)
            .job("good", 2, COMPLETED);
        let (store, cb) = collector();
        let mut scheduler =
            PollingScheduler::new("detect", source, Duration::from_secs(3), Duration::from_secs(60));
        scheduler.watch(JobId::from("bad"), cb());
        scheduler.watch(JobId::from("good"), cb());

        let report = scheduler.tick().await;
        assert_eq!(report.failed, 1);
        assert_eq!(scheduler.pending().ids(), vec![JobId::from("good")]);

        scheduler.run_until_idle().await;
        let got = store.lock().unwrap();
        assert_eq!(got.len(), 2);
        let bad = got.iter().find(|r| r.job_id.0 == "bad").unwrap();
        assert!(matches!(&bad.outcome,
            JobOutcome::Failed(FailureReason::RemoteFailure { job_id, .. }) if job_id == "bad"));
        let good = got.iter().find(|r| r.job_id.0 == "good").unwrap();
        assert!(matches!(good.outcome, JobOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_queries_skip_ticks_instead_of_overlapping() {
        let mut source = ScriptedSource::default().job("slow", usize::MAX, COMPLETED);
        source.query_delay = Some(Duration::from_secs(7));
        let queries = Arc::clone(&source.queries);
        let max_in_flight = Arc::clone(&source.max_in_flight);
        let (store, cb) = collector();

        let mut scheduler =
            PollingScheduler::new("detect", source, Duration::from_secs(3), Duration::from_secs(20));
        scheduler.watch(JobId::from("slow"), cb());
        scheduler.run_until_idle().await;

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        // Without skipping, 20s at a 3s interval would issue 7 queries.
        assert!(queries.lock().unwrap().len() <= 4);
        assert_eq!(store.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_scheduler_accepts_jobs_and_cancellations() {
        let source = ScriptedSource::default()
            .job("keep", 2, COMPLETED)
            .job("drop", 1, COMPLETED);
        let queries = Arc::clone(&source.queries);
        let handle =
            PollingScheduler::new("detect", source, Duration::from_secs(3), Duration::from_secs(60))
                .spawn();

        let dropped = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dropped);
        handle
            .watch(JobId::from("drop"), Box::new(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        handle.cancel(JobId::from("drop")).unwrap();

        let (tx, rx) = oneshot::channel();
        handle
            .watch(JobId::from("keep"), Box::new(move |r| {
                let _ = tx.send(r);
            }))
            .unwrap();

        let resolution = rx.await.unwrap();
        assert_eq!(resolution.job_id, JobId::from("keep"));
        assert!(matches!(resolution.outcome, JobOutcome::Completed(_)));
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        assert!(queries
            .lock()
            .unwrap()
            .iter()
            .all(|q| !q.contains(&JobId::from("drop"))));

        handle.shutdown();
        handle.closed().await;
        assert!(matches!(
            handle.watch(JobId::from("late"), Box::new(|_| {})),
            Err(PipelineError::SchedulerClosed)
        ));
    }
    #[test]
    fn abandon_all_fails_every_pending_job() {
        let now = Instant::now();
        let (store, cb) = collector();
        let mut set = PollSet::new();
        set.insert(JobId::from("a"), now + Duration::from_secs(60), now, cb());
        set.insert(JobId::from("b"), now + Duration::from_secs(60), now, cb());
        assert_eq!(set.abandon_all(), 2);
        assert!(set.is_empty());
        let got = store.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|r| matches!(&r.outcome,
            JobOutcome::Failed(FailureReason::SchedulerStopped { job_id }) if *job_id == r.job_id.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_jobs_still_pending() {
        let source = ScriptedSource::default().job("stuck", usize::MAX, COMPLETED);
        let handle =
            PollingScheduler::new("detect", source, Duration::from_secs(3), Duration::from_secs(600))
                .spawn();

        let (tx, rx) = oneshot::channel();
        handle
            .watch(JobId::from("stuck"), Box::new(move |r| {
                let _ = tx.send(r);
            }))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(7)).await;

        handle.shutdown();
        let resolution = rx.await.unwrap();
        assert_eq!(resolution.job_id, JobId::from("stuck"));
        assert!(matches!(
            resolution.outcome,
            JobOutcome::Failed(FailureReason::SchedulerStopped { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_fails_jobs_still_pending() {
        let source = ScriptedSource::default().job("stuck", usize::MAX, COMPLETED);
        let handle =
            PollingScheduler::new("detect", source, Duration::from_secs(3), Duration::from_secs(600))
                .spawn();
        let (tx, rx) = oneshot::channel();
        handle
            .watch(JobId::from("stuck"), Box::new(move |r| {
                let _ = tx.send(r);
            }))
            .unwrap();
        drop(handle);

        let resolution = rx.await.unwrap();
        assert!(matches!(
            resolution.outcome,
            JobOutcome::Failed(FailureReason::SchedulerStopped { .. })
        ));
    }
}

