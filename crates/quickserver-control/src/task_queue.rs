//! In-process background task queue with bounded exponential backoff.
//!
//! A single ticker takes at most one ready task per tick and hands it to the processor
//! registered for its type. Dispatch is serialized by a mutex, so two destructive operations
//! never run concurrently out of this queue. Contents live in memory only: pending retries
//! are lost if the process dies.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{FleetError, Result};
use crate::shutdown::ShutdownCoordinator;

pub type TaskPayload = serde_json::Value;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, payload: TaskPayload) -> Result<TaskPayload>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total runs allowed. A task failing on attempt `max_retries` is dropped; `0` and `1`
    /// both mean a single run.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the run that follows failed run `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.max(0.0).powi(exp);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

type SuccessCallback = Box<dyn FnOnce(TaskPayload) -> BoxFuture<'static, ()> + Send>;
type ErrorCallback = Box<dyn FnOnce(FleetError) -> BoxFuture<'static, ()> + Send>;

/// Terminal hooks: `on_success` after a successful run, `on_error` once retries are exhausted.
#[derive(Default)]
pub struct TaskCallbacks {
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl TaskCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(TaskPayload) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_success = Some(Box::new(move |v| Box::pin(f(v))));
        self
    }

    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(FleetError) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Box::new(move |e| Box::pin(f(e))));
        self
    }
}

struct QueuedTask {
    id: String,
    task_type: String,
    payload: TaskPayload,
    policy: RetryPolicy,
    attempt: u32,
    scheduled_at: Instant,
    seq: u64,
    callbacks: TaskCallbacks,
}

struct Worker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    tasks: Mutex<Vec<QueuedTask>>,
    processors: RwLock<HashMap<String, Arc<dyn TaskProcessor>>>,
    next_seq: AtomicU64,
    dispatch: tokio::sync::Mutex<()>,
    running: AtomicBool,
    worker: Mutex<Option<Worker>>,
    tick: Duration,
    shutdown: ShutdownCoordinator,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(shutdown: ShutdownCoordinator) -> Self {
        Self::with_tick(shutdown, DEFAULT_TICK)
    }

    pub fn with_tick(shutdown: ShutdownCoordinator, tick: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(Vec::new()),
                processors: RwLock::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                dispatch: tokio::sync::Mutex::new(()),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
                tick: tick.max(Duration::from_millis(10)),
                shutdown,
            }),
        }
    }

    pub fn register_processor(&self, task_type: &str, processor: Arc<dyn TaskProcessor>) {
        self.inner
            .processors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_type.to_string(), processor);
    }

    /// Queues a task to run on the next tick. Returns its id.
    pub fn enqueue(
        &self,
        task_type: &str,
        payload: TaskPayload,
        callbacks: TaskCallbacks,
        policy: Option<RetryPolicy>,
    ) -> String {
        let id = format!("task-{}", uuid::Uuid::new_v4());
        let task = QueuedTask {
            id: id.clone(),
            task_type: task_type.to_string(),
            payload,
            policy: policy.unwrap_or_default(),
            attempt: 1,
            scheduled_at: Instant::now(),
            seq: self.next_seq(),
            callbacks,
        };
        self.lock_tasks().push(task);

        tracing::info!(task_id = %id, task_type, "background task enqueued");
        id
    }

    /// Whether a task of this type with an identical payload is waiting to run.
    pub fn is_queued(&self, task_type: &str, payload: &TaskPayload) -> bool {
        self.lock_tasks()
            .iter()
            .any(|t| t.task_type == task_type && &t.payload == payload)
    }

    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Spawns the ticker. Starting a running queue is a no-op.
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return;
        }

        let (stop, stop_rx) = oneshot::channel();
        let queue = self.clone();
        let handle = tokio::spawn(async move { queue.run_ticker(stop_rx).await });
        *worker = Some(Worker { stop, handle });
        self.inner.running.store(true, Ordering::SeqCst);

        tracing::info!(tick_ms = self.inner.tick.as_millis() as u64, "background task queue started");
    }

    /// Stops the ticker after the in-flight dispatch, if any, has finished.
    pub async fn stop(&self) {
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(worker) = worker else {
            return;
        };

        let _ = worker.stop.send(());
        if let Err(err) = worker.handle.await {
            tracing::error!(%err, "background task queue ticker ended abnormally");
        }
        self.inner.running.store(false, Ordering::SeqCst);

        tracing::info!(remaining = self.len(), "background task queue stopped");
    }

    async fn run_ticker(self, mut stop: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.inner.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; dispatching starts one period after start().
        interval.tick().await;

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = interval.tick() => {
                    self.dispatch_next().await;
                }
            }
        }
    }

    /// Takes the earliest ready task, if any, and runs it. Returns whether a task was taken.
    pub async fn dispatch_next(&self) -> bool {
        let _one_at_a_time = self.inner.dispatch.lock().await;

        let Some(mut task) = self.pop_ready(Instant::now()) else {
            return false;
        };

        let processor = self
            .inner
            .processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task.task_type)
            .cloned();
        let Some(processor) = processor else {
            tracing::warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                "no processor registered for background task type, dropping task"
            );
            return true;
        };

        tracing::debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempt,
            "processing background task"
        );
        let payload = task.payload.clone();
        let outcome = self
            .inner
            .shutdown
            .run(async move { processor.process(payload).await })
            .await;

        match outcome {
            Ok(result) => {
                tracing::info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    attempt = task.attempt,
                    "background task completed successfully"
                );
                if let Some(on_success) = task.callbacks.on_success.take() {
                    on_success(result).await;
                }
            }
            Err(FleetError::ShutdownInProgress) => {
                tracing::info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    "shutdown in progress, leaving background task queued"
                );
                self.lock_tasks().push(task);
            }
            Err(err) => self.handle_failure(task, err).await,
        }

        true
    }

    async fn handle_failure(&self, mut task: QueuedTask, err: FleetError) {
        if task.attempt < task.policy.max_retries {
            let delay = task.policy.delay(task.attempt);
            tracing::warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempt = task.attempt,
                max_retries = task.policy.max_retries,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "background task failed, scheduling retry"
            );
            task.attempt += 1;
            task.scheduled_at = Instant::now() + delay;
            task.seq = self.next_seq();
            self.lock_tasks().push(task);
            return;
        }

        tracing::error!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempt,
            error = %err,
            "background task failed, no retries left"
        );
        if let Some(on_error) = task.callbacks.on_error.take() {
            on_error(err).await;
        }
    }

    fn pop_ready(&self, now: Instant) -> Option<QueuedTask> {
        let mut tasks = self.lock_tasks();
        let index = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.scheduled_at <= now)
            .min_by_key(|(_, t)| (t.scheduled_at, t.seq))
            .map(|(i, _)| i)?;
        Some(tasks.remove(index))
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<QueuedTask>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
