//! Scheduler
//!
//! Two halves sharing this module: the `Scheduler` itself, a periodic tick
//! that consults the [`crate::config::SyncConfigRegistry`] and enqueues one
//! durable sweep task per kind whose interval has elapsed (dependency order
//! falls out of the registry's priority, so ancestors are always enqueued
//! before descendants within the same tick); and `SweepWorker`, the
//! consumer side that drains the queue and dispatches each task, mirroring
//! the pop/process/backoff loop in the teacher's task queue listener.
//!
//! The scheduler never runs a sweep itself — only `enqueue` — so any number
//! of `SweepWorker`s can drain the same queue without coordinating beyond
//! the queue's own `FOR UPDATE SKIP LOCKED` claim.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PolicyKey, SyncConfigRegistry};
use crate::entities::EntityKind;
use crate::error::ErrorCategory;
use crate::store::Store;
use crate::task_queue::{TaskQueue, TaskQueueError, MAX_RETRIES};

/// Default tick interval per spec.
const DEFAULT_TICK_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// Polling interval when the sweep queue is empty, matching the source's
/// `POLL_INTERVAL_MS`.
const POLL_INTERVAL_MS: u64 = 100;

/// Backoff after a dispatch error, matching the source's `ERROR_BACKOFF_MS`.
const ERROR_BACKOFF_MS: u64 = 1000;

/// Above this many stale entities of one kind, the health evaluation
/// raises an alert. Not specified upstream; chosen as a conservative
/// default that only fires once a kind is meaningfully behind rather than
/// on every transient straggler.
const STALE_ALERT_THRESHOLD: u32 = 25;

/// Above this many errors in the most recently recorded sync run, the
/// health evaluation raises an alert.
const FAILURE_ALERT_THRESHOLD: usize = 5;

/// Cap on how many stale ids `scan_stale` is asked to return per kind
/// during health evaluation; we only need the count, not the ids.
const STALE_SCAN_LIMIT: u32 = 1000;

/// Sink for the alerts the health evaluation raises. Notification channels
/// (Slack, PagerDuty, email) are out of scope; this trait is the seam a
/// real deployment wires one in at.
pub trait AlertSink: Send + Sync {
    fn alert(&self, message: &str);
}

/// Logs every alert at `error` level rather than dropping it; the default
/// used wherever a deployment hasn't wired a real notification channel.
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, message: &str) {
        error!(alert = message, "scheduler health alert");
    }
}

#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub enqueued: Vec<PolicyKey>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub stale_counts: Vec<(EntityKind, u32)>,
    pub last_run_errors: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Queue(#[from] TaskQueueError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Periodic producer: enqueues due sweeps and evaluates backlog health.
/// Holds exactly one mirrored root, matching how [`crate::cascade::CascadeOrchestrator`]
/// is scoped to a single `root_directory_id` per run.
pub struct Scheduler<S, Q, A> {
    registry: Arc<SyncConfigRegistry>,
    store: S,
    queue: Q,
    alerts: A,
    root_directory_id: Uuid,
    tick_interval: StdDuration,
}

impl<S: Store, Q: TaskQueue> Scheduler<S, Q, TracingAlertSink> {
    pub fn new(registry: Arc<SyncConfigRegistry>, store: S, queue: Q, root_directory_id: Uuid) -> Self {
        Self::with_alerts(registry, store, queue, TracingAlertSink, root_directory_id, DEFAULT_TICK_INTERVAL)
    }
}

impl<S: Store, Q: TaskQueue, A: AlertSink> Scheduler<S, Q, A> {
    pub fn with_alerts(
        registry: Arc<SyncConfigRegistry>,
        store: S,
        queue: Q,
        alerts: A,
        root_directory_id: Uuid,
        tick_interval: StdDuration,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            alerts,
            root_directory_id,
            tick_interval,
        }
    }

    /// Runs `tick` on `self.tick_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_secs = self.tick_interval.as_secs(), "scheduler started");
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }

    /// One tick: enqueue every due key in priority order, then evaluate
    /// backlog health.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary, SchedulerError> {
        let due = self.registry.due_keys(now);
        for key in &due {
            self.queue.enqueue(*key, self.root_directory_id).await?;
            self.registry.record_attempt(*key, now);
            debug!(key = key.as_str(), "enqueued due sweep");
        }
        if !due.is_empty() {
            info!(count = due.len(), "scheduler tick enqueued sweeps");
        }

        let health = self.evaluate_health(now).await?;
        self.raise_alerts(&health);

        Ok(TickSummary { enqueued: due })
    }

    async fn evaluate_health(&self, now: DateTime<Utc>) -> Result<HealthReport, SchedulerError> {
        let mut stale_counts = Vec::new();
        for kind in self.registry.entity_sweep_order() {
            let threshold = self
                .registry
                .get(PolicyKey::Entity(kind))
                .map(|p| p.staleness_threshold)
                .unwrap_or_else(|| Duration::hours(2));
            let ids = self
                .store
                .scan_stale(kind, now - threshold, STALE_SCAN_LIMIT)
                .await?;
            stale_counts.push((kind, ids.len() as u32));
        }

        let last_run_errors = self
            .store
            .latest_sync_run(None)
            .await?
            .map(|r| r.error_count())
            .unwrap_or(0);

        Ok(HealthReport {
            stale_counts,
            last_run_errors,
        })
    }

    fn raise_alerts(&self, health: &HealthReport) {
        for (kind, count) in &health.stale_counts {
            if *count >= STALE_ALERT_THRESHOLD {
                self.alerts.alert(&format!(
                    "{kind} has {count} entities past their staleness threshold"
                ));
            }
        }
        if health.last_run_errors >= FAILURE_ALERT_THRESHOLD {
            self.alerts.alert(&format!(
                "latest sync run recorded {} errors",
                health.last_run_errors
            ));
        }
    }
}

/// Error surfaced by a [`SweepDispatcher`]; carries enough of the
/// original's [`crate::error::Categorized`] classification for the worker
/// to decide retry vs. dead-letter without depending on every concrete
/// error type a dispatcher might wrap.
#[derive(Debug)]
pub struct DispatchError {
    pub message: String,
    pub category: ErrorCategory,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DispatchError {}

impl DispatchError {
    pub fn from_categorized<E: crate::error::Categorized + std::fmt::Display>(e: E) -> Self {
        Self {
            category: e.category(),
            message: e.to_string(),
        }
    }
}

/// One sweep task's worth of work, dispatched by kind. Implemented in the
/// binary's wiring layer so this module stays independent of the concrete
/// `CascadeOrchestrator`/`PartsParserWorker` types.
#[async_trait]
pub trait SweepDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        key: PolicyKey,
        scope_root: Uuid,
        cancel: CancellationToken,
    ) -> Result<(), DispatchError>;
}

/// Consumer side: claims one task at a time, dispatches it, and completes,
/// requeues, or dead-letters it based on the outcome. Mirrors the
/// teacher's `TaskQueueListener::run`/`process_one` shape.
pub struct SweepWorker<Q, D> {
    queue: Q,
    dispatcher: D,
}

impl<Q: TaskQueue, D: SweepDispatcher> SweepWorker<Q, D> {
    pub fn new(queue: Q, dispatcher: D) -> Self {
        Self { queue, dispatcher }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("sweep worker started");
        loop {
            if cancel.is_cancelled() {
                info!("sweep worker stopping");
                break;
            }

            match self.process_one(cancel.clone()).await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(StdDuration::from_millis(POLL_INTERVAL_MS)) => {}
                        _ = cancel.cancelled() => {
                            info!("sweep worker stopping");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "sweep worker failed to process a task");
                    tokio::time::sleep(StdDuration::from_millis(ERROR_BACKOFF_MS)).await;
                }
            }
        }
    }

    /// Returns `Ok(true)` if a task was claimed and processed (success or
    /// requeue/dead-letter), `Ok(false)` if the queue was empty.
    async fn process_one(&self, cancel: CancellationToken) -> Result<bool, TaskQueueError> {
        let Some(task) = self.queue.pop_next().await? else {
            return Ok(false);
        };

        match self.dispatcher.dispatch(task.key, task.scope_root, cancel).await {
            Ok(()) => {
                self.queue.complete(task.id).await?;
            }
            Err(e) => {
                let exhausted = task.retry_count + 1 >= MAX_RETRIES;
                if exhausted || !e.category.is_retriable() {
                    warn!(
                        task_id = task.id,
                        key = task.key.as_str(),
                        error = %e,
                        "moving sweep task to dead-letter queue"
                    );
                    self.queue.move_to_dlq(&task, &e.message).await?;
                } else {
                    warn!(
                        task_id = task.id,
                        key = task.key.as_str(),
                        error = %e,
                        "requeueing sweep task after dispatch failure"
                    );
                    self.queue.requeue(task.id, &e.message).await?;
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuxiliaryJob;
    use crate::store::InMemoryStore;
    use crate::task_queue::InMemoryTaskQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingAlertSink {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingAlertSink {
        fn new() -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
            }
        }
    }

    impl AlertSink for RecordingAlertSink {
        fn alert(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    #[tokio::test]
    async fn first_tick_enqueues_every_enabled_kind_in_priority_order() {
        let registry = Arc::new(SyncConfigRegistry::with_defaults());
        let store = InMemoryStore::new();
        let queue = InMemoryTaskQueue::new();
        let root = Uuid::new_v4();
        let scheduler = Scheduler::with_alerts(
            registry,
            store,
            queue,
            RecordingAlertSink::new(),
            root,
            DEFAULT_TICK_INTERVAL,
        );

        let summary = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(
            summary.enqueued,
            vec![
                PolicyKey::Entity(EntityKind::Directory),
                PolicyKey::Entity(EntityKind::Project),
                PolicyKey::Entity(EntityKind::Phase),
                PolicyKey::Entity(EntityKind::Elevation),
                PolicyKey::Auxiliary(AuxiliaryJob::SqliteParser),
                PolicyKey::Auxiliary(AuxiliaryJob::ParsingErrors),
            ]
        );
    }

    #[tokio::test]
    async fn second_tick_immediately_after_enqueues_nothing_new() {
        let registry = Arc::new(SyncConfigRegistry::with_defaults());
        let store = InMemoryStore::new();
        let queue = InMemoryTaskQueue::new();
        let root = Uuid::new_v4();
        let scheduler = Scheduler::with_alerts(
            registry.clone(),
            store,
            queue,
            RecordingAlertSink::new(),
            root,
            DEFAULT_TICK_INTERVAL,
        );

        let now = Utc::now();
        scheduler.tick(now).await.unwrap();
        for key in [
            PolicyKey::Entity(EntityKind::Directory),
            PolicyKey::Entity(EntityKind::Project),
            PolicyKey::Entity(EntityKind::Phase),
            PolicyKey::Entity(EntityKind::Elevation),
            PolicyKey::Auxiliary(AuxiliaryJob::SqliteParser),
            PolicyKey::Auxiliary(AuxiliaryJob::ParsingErrors),
        ] {
            registry.record_sync(key, now);
        }

        let summary = scheduler.tick(now).await.unwrap();
        assert!(summary.enqueued.is_empty());
    }

    struct CountingDispatcher {
        calls: AtomicUsize,
        fail_until: usize,
    }

    #[async_trait]
    impl SweepDispatcher for CountingDispatcher {
        async fn dispatch(
            &self,
            _key: PolicyKey,
            _scope_root: Uuid,
            _cancel: CancellationToken,
        ) -> Result<(), DispatchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_until {
                Err(DispatchError {
                    message: "transient failure".into(),
                    category: ErrorCategory::Transport,
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn failed_dispatch_is_requeued_then_eventually_completes() {
        let queue = InMemoryTaskQueue::new();
        queue
            .enqueue(PolicyKey::Entity(EntityKind::Directory), Uuid::new_v4())
            .await
            .unwrap();
        let dispatcher = CountingDispatcher {
            calls: AtomicUsize::new(0),
            fail_until: 1,
        };
        let worker = SweepWorker::new(queue, dispatcher);

        assert!(worker.process_one(CancellationToken::new()).await.unwrap());
        assert!(worker.process_one(CancellationToken::new()).await.unwrap());
        assert!(!worker.process_one(CancellationToken::new()).await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_retries_move_to_dead_letter_queue() {
        let queue = InMemoryTaskQueue::new();
        queue
            .enqueue(PolicyKey::Entity(EntityKind::Directory), Uuid::new_v4())
            .await
            .unwrap();
        let dispatcher = CountingDispatcher {
            calls: AtomicUsize::new(0),
            fail_until: usize::MAX,
        };
        let worker = SweepWorker::new(queue, dispatcher);

        for _ in 0..MAX_RETRIES {
            assert!(worker.process_one(CancellationToken::new()).await.unwrap());
        }
        assert_eq!(worker.queue.dlq_len().await, 1);
    }
}
