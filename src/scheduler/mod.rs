//! Debounced background reflection
//!
//! [`ReflectionScheduler::submit`] arms a delayed reconciliation for a key
//! (typically a conversation thread). A newer submission for the same key
//! supersedes the older one:
//!
//! - a Pending job is cancelled outright and never touches the store;
//! - a Running job is cancelled cooperatively: its extraction future is
//!   dropped, or if it already returned, its edits are discarded. Once the
//!   apply step has begun it runs to completion and is not rolled back.
//!
//! Per key at most one job is Running at a time: a successor waits for every
//! job it superseded to reach a terminal state before it starts. Jobs for
//! different keys run independently, except that the snapshot-through-apply
//! phase holds the target namespace exclusively.

mod job;
mod locks;

pub use job::{JobEvent, JobHandle, JobId, JobOutcome, JobStatus, ReflectionRequest};

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::ApplyReport;
use crate::reconcile::{ReconcileConfig, Reconciler};
use crate::storage::MemoryStore;
use job::JobState;
use locks::NamespaceLocks;

/// Schedules deferred, cancellable reconciliations and applies their edits to a store
#[derive(Clone)]
pub struct ReflectionScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    reconciler: Reconciler,
    store: Arc<dyn MemoryStore>,
    config: Config,
    reconcile_defaults: ReconcileConfig,
    jobs: Mutex<JobTable>,
    locks: NamespaceLocks,
    limiter: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    runtime: Handle,
    events: broadcast::Sender<JobEvent>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct JobTable {
    closed: bool,
    entries: HashMap<String, JobEntry>,
}

/// The single non-terminal job currently owning a key
struct JobEntry {
    id: JobId,
    cancel: CancellationToken,
    state: Arc<watch::Sender<JobState>>,
    /// Superseded jobs that may still be running
    predecessors: Vec<watch::Receiver<JobState>>,
}

struct Job {
    id: JobId,
    key: String,
    request: ReflectionRequest,
    delay: Duration,
    cancel: CancellationToken,
    state: Arc<watch::Sender<JobState>>,
    predecessors: Vec<watch::Receiver<JobState>>,
}

impl ReflectionScheduler {
    /// Create a scheduler using default reconcile options.
    ///
    /// Must be called from within a tokio runtime; jobs are spawned onto it.
    pub fn new(reconciler: Reconciler, store: Arc<dyn MemoryStore>, config: Config) -> Result<Self> {
        Self::with_reconcile_defaults(reconciler, store, config, ReconcileConfig::default())
    }

    /// Create a scheduler whose requests fall back to `reconcile_defaults`
    pub fn with_reconcile_defaults(
        reconciler: Reconciler,
        store: Arc<dyn MemoryStore>,
        config: Config,
        reconcile_defaults: ReconcileConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::config(format!("reflection scheduler needs a tokio runtime: {}", e)))?;

        let limiter = config
            .max_concurrent_jobs
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Self {
            inner: Arc::new(Inner {
                reconciler,
                store,
                config,
                reconcile_defaults,
                jobs: Mutex::new(JobTable::default()),
                locks: NamespaceLocks::default(),
                limiter,
                tracker: TaskTracker::new(),
                runtime,
                events,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Schedule a reflection for `key` after `delay`, superseding any job already
    /// pending or running for the same key. Never blocks.
    pub fn submit(
        &self,
        key: impl Into<String>,
        request: ReflectionRequest,
        delay: Duration,
    ) -> Result<JobHandle> {
        let key = key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(JobState::Pending);
        let state = Arc::new(tx);

        let predecessors = {
            let mut table = self.inner.lock_jobs();
            if table.closed {
                return Err(Error::cancelled("reflection scheduler is shut down"));
            }

            let previous = table.entries.remove(&key);
            let predecessors = match previous {
                Some(prev) => {
                    let prev_status = prev.state.borrow().status();
                    prev.cancel.cancel();
                    debug!(key = %key, superseded = prev.id, status = %prev_status, "Superseding reflection");

                    let mut waits: Vec<_> = prev
                        .predecessors
                        .into_iter()
                        .filter(|rx| !rx.borrow().status().is_terminal())
                        .collect();
                    waits.push(prev.state.subscribe());
                    waits
                }
                None => Vec::new(),
            };

            table.entries.insert(
                key.clone(),
                JobEntry {
                    id,
                    cancel: cancel.clone(),
                    state: state.clone(),
                    predecessors: predecessors.clone(),
                },
            );
            predecessors
        };

        debug!(key = %key, job_id = id, delay_ms = delay.as_millis() as u64, "Reflection scheduled");
        self.inner.emit(id, &key, JobStatus::Pending, None);

        let job = Job {
            id,
            key: key.clone(),
            request,
            delay,
            cancel,
            state,
            predecessors,
        };
        let inner = self.inner.clone();
        self.inner
            .runtime
            .spawn(self.inner.tracker.track_future(inner.run(job)));

        Ok(JobHandle::new(id, key, rx))
    }

    /// Like [`submit`](Self::submit) with the configured default delay
    pub fn submit_with_default_delay(
        &self,
        key: impl Into<String>,
        request: ReflectionRequest,
    ) -> Result<JobHandle> {
        self.submit(key, request, self.inner.config.default_delay)
    }

    /// Reconcile and apply immediately on the caller's task (the hot path).
    ///
    /// Shares the namespace critical section with background jobs but is not
    /// tracked per key and cannot be superseded.
    pub async fn reflect_now(&self, request: ReflectionRequest) -> Result<ApplyReport> {
        let closed = self.inner.lock_jobs().closed;
        if closed {
            return Err(Error::cancelled("reflection scheduler is shut down"));
        }
        self.inner.execute(&request, &CancellationToken::new()).await
    }

    /// Status of the live (non-terminal) job for `key`, if any
    pub fn status(&self, key: &str) -> Option<JobStatus> {
        let table = self.inner.lock_jobs();
        table.entries.get(key).map(|entry| entry.state.borrow().status())
    }

    /// Number of keys with a live job
    pub fn active_jobs(&self) -> usize {
        self.inner.lock_jobs().entries.len()
    }

    /// Receive an event for every job status transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Stop accepting work.
    ///
    /// Pending jobs are always cancelled and no job becomes Running after this
    /// is called. With `wait_for_completion`, running jobs are left to finish
    /// and this returns once they are terminal; without it, running jobs are
    /// cancelled cooperatively and this returns immediately.
    pub async fn shutdown(&self, wait_for_completion: bool) {
        let cancelled = {
            let mut table = self.inner.lock_jobs();
            table.closed = true;

            let mut cancelled = 0usize;
            for entry in table.entries.values() {
                let running = entry.state.borrow().status() == JobStatus::Running;
                if !running || !wait_for_completion {
                    entry.cancel.cancel();
                    cancelled += 1;
                }
            }
            cancelled
        };

        info!(cancelled, wait_for_completion, "Shutting down reflection scheduler");
        self.inner.tracker.close();

        if wait_for_completion {
            self.inner.tracker.wait().await;
            info!("Reflection scheduler drained");
        }
    }
}

impl Inner {
    fn lock_jobs(&self) -> MutexGuard<'_, JobTable> {
        // no critical section panics, so a poisoned table is still consistent
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, job_id: JobId, key: &str, status: JobStatus, error: Option<String>) {
        // no subscribers is fine
        let _ = self.events.send(JobEvent {
            job_id,
            key: key.to_string(),
            status,
            error,
        });
    }

    async fn run(self: Arc<Self>, mut job: Job) {
        // a panicking extractor or store must still leave the job terminal
        let outcome = match AssertUnwindSafe(self.drive(&mut job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => JobOutcome::Failed(Arc::new(Error::panicked(panic_message(payload.as_ref())))),
        };
        self.finish(&job, outcome);
    }

    async fn drive(&self, job: &mut Job) -> JobOutcome {
        tokio::select! {
            biased;
            _ = job.cancel.cancelled() => return JobOutcome::Cancelled,
            _ = tokio::time::sleep(job.delay) => {}
        }

        for mut predecessor in std::mem::take(&mut job.predecessors) {
            tokio::select! {
                biased;
                _ = job.cancel.cancelled() => return JobOutcome::Cancelled,
                _ = wait_terminal(&mut predecessor) => {}
            }
        }

        let _permit = match self.acquire_permit(&job.cancel).await {
            Ok(permit) => permit,
            Err(_) => return JobOutcome::Cancelled,
        };

        if !self.mark_running(job) {
            return JobOutcome::Cancelled;
        }

        match self.execute(&job.request, &job.cancel).await {
            Ok(report) => JobOutcome::Completed(report),
            Err(err) if err.is_cancelled() => JobOutcome::Cancelled,
            Err(err) => JobOutcome::Failed(Arc::new(err)),
        }
    }

    async fn acquire_permit(&self, cancel: &CancellationToken) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled("cancelled while queued")),
            permit = limiter.clone().acquire_owned() => permit
                .map(Some)
                .map_err(|_| Error::cancelled("concurrency limiter closed")),
        }
    }

    /// Pending -> Running, decided under the table lock so shutdown cannot race it
    fn mark_running(&self, job: &Job) -> bool {
        let table = self.lock_jobs();
        if table.closed || job.cancel.is_cancelled() {
            return false;
        }
        job.state.send_replace(JobState::Running);
        self.emit(job.id, &job.key, JobStatus::Running, None);
        true
    }

    /// Resolve, lock, snapshot, reconcile, apply
    async fn execute(&self, request: &ReflectionRequest, cancel: &CancellationToken) -> Result<ApplyReport> {
        let namespace = request.namespace.resolve(&request.bindings)?;
        let config = request.config.as_ref().unwrap_or(&self.reconcile_defaults);

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled("cancelled waiting for namespace")),
            guard = self.locks.acquire(&namespace) => guard,
        };

        let snapshot = self.store.snapshot(&namespace).await?;

        let edits = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled("superseded during extraction")),
            result = self.reconciler.reconcile(&request.conversation, &snapshot, config, cancel) => result?,
        };

        if cancel.is_cancelled() {
            return Err(Error::cancelled("superseded before apply, discarding edits"));
        }
        if edits.is_empty() {
            debug!(%namespace, "Reconciliation produced no edits");
            return Ok(ApplyReport::default());
        }

        // past this point a late cancellation no longer stops or rolls back the apply
        self.store.apply(&namespace, &edits).await
    }

    fn finish(&self, job: &Job, outcome: JobOutcome) {
        match &outcome {
            JobOutcome::Completed(report) => info!(
                key = %job.key,
                job_id = job.id,
                inserted = report.inserted.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                skipped = report.missing_updates.len() + report.missing_removes.len(),
                "Reflection completed"
            ),
            JobOutcome::Cancelled => debug!(key = %job.key, job_id = job.id, "Reflection cancelled"),
            JobOutcome::Failed(err) => error!(key = %job.key, job_id = job.id, error = %err, "Reflection failed"),
        }

        // publish under the table lock so a successor either sees this job
        // terminal or still finds it in the table and waits on it
        let mut table = self.lock_jobs();
        let error = outcome.error().map(|e| e.to_string());
        self.emit(job.id, &job.key, outcome.status(), error);
        job.state.send_replace(JobState::Done(outcome));
        if table.entries.get(&job.key).map(|entry| entry.id) == Some(job.id) {
            table.entries.remove(&job.key);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolve once the watched job is terminal or its task is gone
async fn wait_terminal(state: &mut watch::Receiver<JobState>) {
    loop {
        let done = state.borrow_and_update().status().is_terminal();
        if done || state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractionRequest, Extractor, FnExtractor};
    use crate::memory::EditOp;
    use crate::message::Message;
    use crate::schema::TEXT_KIND;
    use crate::storage::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Inserts the last user message verbatim
    fn echo_reconciler() -> Reconciler {
        Reconciler::new(Arc::new(FnExtractor::new(|req: &ExtractionRequest| {
            let last = req.transcript.lines().last().unwrap_or_default();
            Ok(vec![EditOp::insert(TEXT_KIND, json!(last))])
        })))
    }

    fn request(text: &str) -> ReflectionRequest {
        ReflectionRequest::new(["memories", "{user_id}"], vec![Message::user(text)])
            .with_binding("user_id", "u-1")
    }

    fn setup(reconciler: Reconciler, config: Config) -> (ReflectionScheduler, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = ReflectionScheduler::new(reconciler, store.clone(), config).unwrap();
        (scheduler, store)
    }

    /// Takes `latency` to answer, unless dropped first
    struct SlowExtractor {
        latency: Duration,
    }

    #[async_trait]
    impl Extractor for SlowExtractor {
        async fn extract(&self, req: ExtractionRequest, _cancel: CancellationToken) -> Result<Vec<EditOp>> {
            tokio::time::sleep(self.latency).await;
            Ok(vec![EditOp::insert(TEXT_KIND, json!(req.transcript.trim()))])
        }
    }

    #[test]
    fn test_new_outside_runtime_is_config_error() {
        let result = ReflectionScheduler::new(echo_reconciler(), Arc::new(InMemoryStore::new()), Config::default());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_after_delay() {
        let (scheduler, store) = setup(echo_reconciler(), Config::default());

        let handle = scheduler
            .submit("t1", request("I like tea"), Duration::from_millis(500))
            .unwrap();
        assert_eq!(handle.status(), JobStatus::Pending);
        assert_eq!(scheduler.status("t1"), Some(JobStatus::Pending));

        let outcome = handle.wait().await;
        assert_eq!(outcome.status(), JobStatus::Completed);
        assert_eq!(outcome.report().unwrap().inserted.len(), 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(scheduler.active_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_job_is_superseded() {
        let (scheduler, store) = setup(echo_reconciler(), Config::default());

        let first = scheduler
            .submit("t1", request("conv1"), Duration::from_millis(500))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = scheduler
            .submit("t1", request("conv2"), Duration::from_millis(500))
            .unwrap();

        assert_eq!(first.wait().await.status(), JobStatus::Cancelled);
        assert_eq!(second.wait().await.status(), JobStatus::Completed);

        let ns = crate::namespace::Namespace::new(["memories", "u-1"]).unwrap();
        let records = store.snapshot(&ns).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, json!("user: conv2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_job_result_is_discarded_when_superseded() {
        let reconciler = Reconciler::new(Arc::new(SlowExtractor {
            latency: Duration::from_secs(2),
        }));
        let (scheduler, store) = setup(reconciler, Config::default());

        let first = scheduler.submit("t1", request("conv1"), Duration::ZERO).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(first.status(), JobStatus::Running);

        let second = scheduler.submit("t1", request("conv2"), Duration::ZERO).unwrap();

        assert_eq!(first.wait().await.status(), JobStatus::Cancelled);
        assert_eq!(second.wait().await.status(), JobStatus::Completed);

        let all = store
            .search(&crate::namespace::Namespace::parse("").unwrap(), "", 10, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, json!("user: conv2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_reported_not_swallowed() {
        let reconciler = Reconciler::new(Arc::new(FnExtractor::new(|_: &ExtractionRequest| {
            Err(Error::extraction("model refused"))
        })));
        let (scheduler, store) = setup(reconciler, Config::default());
        let mut events = scheduler.subscribe();

        let handle = scheduler.submit("t1", request("hi"), Duration::ZERO).unwrap();
        let outcome = handle.wait().await;

        assert_eq!(outcome.status(), JobStatus::Failed);
        assert!(matches!(outcome.error(), Some(Error::Extraction(_))));
        assert!(store.is_empty().await);

        let statuses: Vec<JobStatus> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses, vec![JobStatus::Pending, JobStatus::Running, JobStatus::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_extractor_fails_the_job() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let reconciler = Reconciler::new(Arc::new(FnExtractor::new(move |req: &ExtractionRequest| -> Result<Vec<EditOp>> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("model client blew up");
            }
            Ok(vec![EditOp::insert(TEXT_KIND, json!(req.transcript))])
        })));
        let (scheduler, store) = setup(reconciler, Config::default());
        let mut events = scheduler.subscribe();

        let handle = scheduler.submit("t1", request("hi"), Duration::ZERO).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("job never reached a terminal state");

        assert_eq!(outcome.status(), JobStatus::Failed);
        assert!(matches!(outcome.error(), Some(Error::Panicked(msg)) if msg.contains("model client blew up")));
        assert_eq!(scheduler.status("t1"), None);
        assert_eq!(scheduler.active_jobs(), 0);
        assert!(store.is_empty().await);

        let statuses: Vec<JobStatus> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses, vec![JobStatus::Pending, JobStatus::Running, JobStatus::Failed]);

        // the namespace lock was released by the unwind
        let report = tokio::time::timeout(Duration::from_secs(2), scheduler.reflect_now(request("still works")))
            .await
            .expect("namespace lock still held")
            .unwrap();
        assert_eq!(report.inserted.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_successor_runs_only_after_predecessor_is_terminal() {
        let (scheduler, _store) = setup(echo_reconciler(), Config::default());
        let mut events = scheduler.subscribe();

        let mut last = None;
        for i in 0..40 {
            let handle = scheduler
                .submit("t1", request(&format!("turn {}", i)), Duration::ZERO)
                .unwrap();
            if i % 4 == 0 {
                tokio::task::yield_now().await;
            }
            last = Some(handle);
        }
        last.unwrap().wait().await;
        scheduler.shutdown(true).await;

        let mut terminal = std::collections::HashSet::new();
        let mut started = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event.status {
                JobStatus::Running => {
                    for earlier in &started {
                        assert!(
                            terminal.contains(earlier),
                            "job {} started while job {} was not terminal",
                            event.job_id,
                            earlier
                        );
                    }
                    started.push(event.job_id);
                }
                status if status.is_terminal() => {
                    terminal.insert(event.job_id);
                }
                _ => {}
            }
        }
        assert!(!started.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbound_namespace_fails_before_store_access() {
        let (scheduler, store) = setup(echo_reconciler(), Config::default());

        let request = ReflectionRequest::new(["memories", "{user_id}"], vec![Message::user("hi")]);
        let outcome = scheduler.submit("t1", request, Duration::ZERO).unwrap().wait().await;

        assert!(matches!(outcome.error(), Some(Error::Configuration(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_queues_jobs() {
        let reconciler = Reconciler::new(Arc::new(SlowExtractor {
            latency: Duration::from_secs(1),
        }));
        let config = Config::default().with_max_concurrent_jobs(1);
        let (scheduler, _store) = setup(reconciler, config);

        let a = scheduler
            .submit("a", request("a").with_binding("user_id", "a"), Duration::ZERO)
            .unwrap();
        let b = scheduler
            .submit("b", request("b").with_binding("user_id", "b"), Duration::ZERO)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let running = [a.status(), b.status()]
            .iter()
            .filter(|s| **s == JobStatus::Running)
            .count();
        assert_eq!(running, 1);

        assert_eq!(a.wait().await.status(), JobStatus::Completed);
        assert_eq!(b.wait().await.status(), JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reflect_now_applies_immediately() {
        let (scheduler, store) = setup(echo_reconciler(), Config::default());

        let report = scheduler.reflect_now(request("I live in Lisbon")).await.unwrap();
        assert_eq!(report.inserted.len(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_and_rejects_new_work() {
        let (scheduler, store) = setup(echo_reconciler(), Config::default());

        let pending = scheduler
            .submit("t1", request("later"), Duration::from_secs(60))
            .unwrap();
        scheduler.shutdown(true).await;

        assert_eq!(pending.wait().await.status(), JobStatus::Cancelled);
        assert!(store.is_empty().await);

        let err = scheduler
            .submit("t2", request("too late"), Duration::ZERO)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(scheduler.reflect_now(request("too late")).await.unwrap_err().is_cancelled());
    }
}
