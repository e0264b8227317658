//! Worker pool and scheduler.
//!
//! The scheduler pulls schedulable tasks from the store on a fixed tick and
//! feeds a bounded channel. The pool manager sizes the worker set once a
//! minute from the work window and the force-run flag. Workers lease tasks,
//! drive the encode driver, and record outcomes; a drain never interrupts
//! an in-flight encode.

use crate::classify::classify_error;
use crate::encode::EncodeDriver;
use crate::media::tail_of;
use crate::metrics::SharedMetrics;
use crate::store::{Task, TaskStatus, TaskStore, MAX_ATTEMPTS};
use chrono::Timelike;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stm_config::SharedConfig;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Period of the pool-manager sizing tick.
const POOL_MANAGE_INTERVAL: Duration = Duration::from_secs(60);

/// Snapshot of pool state for the operator plane.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStatus {
    pub in_work_window: bool,
    pub force_run: bool,
    pub worker_count: usize,
    pub max_workers: usize,
    pub active_tasks: i64,
    pub queued_tasks: usize,
}

type TaskReceiver = Arc<Mutex<mpsc::Receiver<Task>>>;

struct PoolState {
    force_run: bool,
    max_workers: usize,
    worker_count: usize,
    /// Set while draining so the scheduler stops feeding the queue
    stopped: bool,
    queue_tx: mpsc::Sender<Task>,
    queue_rx: TaskReceiver,
    workers: Vec<JoinHandle<()>>,
}

/// Everything a worker task needs, detached from the pool so an encode
/// outlives any pool bookkeeping.
#[derive(Clone)]
struct WorkerContext {
    store: TaskStore,
    driver: EncodeDriver,
    metrics: SharedMetrics,
    active_tasks: Arc<AtomicI64>,
}

/// The worker pool. One instance per process, shared behind an Arc.
pub struct WorkerPool {
    config: SharedConfig,
    ctx: WorkerContext,
    state: RwLock<PoolState>,
}

impl WorkerPool {
    pub fn new(
        config: SharedConfig,
        store: TaskStore,
        driver: EncodeDriver,
        metrics: SharedMetrics,
    ) -> Arc<Self> {
        let system = config.system();
        let (queue_tx, queue_rx) = mpsc::channel(system.task_queue_size);
        Arc::new(Self {
            config,
            ctx: WorkerContext {
                store,
                driver,
                metrics,
                active_tasks: Arc::new(AtomicI64::new(0)),
            },
            state: RwLock::new(PoolState {
                force_run: false,
                max_workers: system.max_workers,
                worker_count: 0,
                stopped: true,
                queue_tx,
                queue_rx: Arc::new(Mutex::new(queue_rx)),
                workers: Vec::new(),
            }),
        })
    }

    /// Run scheduler and pool manager until `shutdown` fires, then drain:
    /// close the queue, let workers finish their current encode, and wait
    /// for all of them.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("worker pool started");

        let scheduler = {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.scheduler_loop(shutdown).await })
        };
        let manager = {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.manage_loop(shutdown).await })
        };

        shutdown.cancelled().await;
        info!("stop requested, waiting for in-flight encodes");

        let _ = scheduler.await;
        let _ = manager.await;
        self.shutdown_drain().await;
        info!("worker pool stopped");
    }

    /// Periodically feed schedulable tasks into the queue.
    async fn scheduler_loop(&self, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.system().scheduler_interval_seconds);
        info!(interval_secs = interval.as_secs(), "scheduler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.schedule_tick().await,
            }
        }
    }

    /// One scheduler pass: respect the window, back off during a drain,
    /// and top the queue up to its capacity.
    pub async fn schedule_tick(&self) {
        if !self.in_work_window() && !self.force_run().await {
            return;
        }

        let (stopped, queue_tx) = {
            let state = self.state.read().await;
            (state.stopped, state.queue_tx.clone())
        };
        if stopped {
            return;
        }

        let limit = queue_tx.capacity();
        if limit == 0 {
            return;
        }

        let tasks = match self.ctx.store.get_pending_batch(limit as i64).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "pending batch query failed");
                return;
            }
        };
        if tasks.is_empty() {
            return;
        }
        info!(count = tasks.len(), "queueing pending tasks");

        for task in tasks {
            let id = task.id;
            match queue_tx.try_send(task) {
                Ok(()) => debug!(task_id = id, "task queued"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(task_id = id, "queue full, task skipped")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Re-derive and apply the target worker count once a minute.
    async fn manage_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(POOL_MANAGE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.apply_target().await,
            }
        }
    }

    /// Compare the target worker count against the live pool and adjust.
    pub async fn apply_target(&self) {
        let target = self.target_worker_count().await;
        let current = self.state.read().await.worker_count;
        if target != current {
            info!(current, target, "adjusting worker pool");
            self.adjust_pool(target).await;
        }
    }

    async fn target_worker_count(&self) -> usize {
        let (force_run, max_workers) = {
            let state = self.state.read().await;
            (state.force_run, state.max_workers)
        };
        let system = self.config.system();
        let hour = chrono::Local::now().hour() as u8;
        target_worker_count_at(hour, force_run, max_workers, system.work_start, system.work_end)
    }

    pub(crate) async fn adjust_pool(&self, target: usize) {
        let mut state = self.state.write().await;
        let current = state.worker_count;

        if current == 0 && target > 0 {
            state.stopped = false;
            state.worker_count = target;
            for worker_id in 1..=target {
                let ctx = self.ctx.clone();
                let queue_rx = state.queue_rx.clone();
                state
                    .workers
                    .push(tokio::spawn(async move {
                        ctx.worker_loop(worker_id, queue_rx).await
                    }));
            }
            self.ctx.metrics.workers_active.set(target as f64);
            info!(count = target, "workers started");
        } else if current > 0 && target == 0 {
            // Drain: stop feeding first, then wait for quiet
            state.stopped = true;

            let active = self.ctx.active_tasks.load(Ordering::Relaxed);
            let queued = state.queue_tx.max_capacity() - state.queue_tx.capacity();
            if active > 0 || queued > 0 {
                info!(active, queued, "waiting for tasks to finish before stopping");
                return;
            }

            // Swapping in a fresh channel drops the old sender; idle
            // workers observe the closed queue and exit after their
            // current attempt.
            let queue_size = self.config.system().task_queue_size;
            let (queue_tx, queue_rx) = mpsc::channel(queue_size);
            state.queue_tx = queue_tx;
            state.queue_rx = Arc::new(Mutex::new(queue_rx));
            let workers = std::mem::take(&mut state.workers);
            drop(state);

            for handle in workers {
                let _ = handle.await;
            }

            let mut state = self.state.write().await;
            state.worker_count = 0;
            self.ctx.metrics.workers_active.set(0.0);
            info!("all workers stopped");
        } else if current > 0 && target > 0 && current != target {
            // Incremental resizing is not supported; the pool keeps its
            // size until it next drains to zero.
            info!(current, target, "pool resize deferred until next drain");
        }
    }

    /// Final drain on process shutdown. Closes the queue unconditionally;
    /// in-flight encodes still run to completion inside their worker task.
    async fn shutdown_drain(&self) {
        let workers = {
            let mut state = self.state.write().await;
            state.stopped = true;
            let queue_size = self.config.system().task_queue_size;
            let (queue_tx, queue_rx) = mpsc::channel(queue_size);
            state.queue_tx = queue_tx;
            state.queue_rx = Arc::new(Mutex::new(queue_rx));
            state.worker_count = 0;
            std::mem::take(&mut state.workers)
        };
        for handle in workers {
            let _ = handle.await;
        }
        self.ctx.metrics.workers_active.set(0.0);
    }

    /// Whether the wall clock currently falls inside the work window.
    pub fn in_work_window(&self) -> bool {
        let system = self.config.system();
        let hour = chrono::Local::now().hour() as u8;
        is_within_window(hour, system.work_start, system.work_end)
    }

    pub async fn force_run(&self) -> bool {
        self.state.read().await.force_run
    }

    /// Flip the force-run override and re-evaluate the pool size out of
    /// band rather than waiting for the next manager tick.
    pub async fn set_force_run(&self, enable: bool) {
        self.state.write().await.force_run = enable;
        if enable {
            info!("force-run enabled");
        } else {
            info!("force-run disabled");
        }
        self.apply_target().await;
    }

    /// Adjust the worker ceiling at runtime (clamped to 1..=10).
    pub async fn set_max_workers(&self, count: usize) {
        let count = count.clamp(1, 10);
        self.state.write().await.max_workers = count;
        info!(max_workers = count, "worker ceiling updated");
        self.apply_target().await;
    }

    pub async fn status(&self) -> WorkerStatus {
        let state = self.state.read().await;
        WorkerStatus {
            in_work_window: self.in_work_window(),
            force_run: state.force_run,
            worker_count: state.worker_count,
            max_workers: state.max_workers,
            active_tasks: self.ctx.active_tasks.load(Ordering::Relaxed),
            queued_tasks: state.queue_tx.max_capacity() - state.queue_tx.capacity(),
        }
    }
}

impl WorkerContext {
    async fn worker_loop(self, worker_id: usize, queue_rx: TaskReceiver) {
        info!(worker_id, "worker started");
        loop {
            let task = {
                let mut rx = queue_rx.lock().await;
                rx.recv().await
            };
            let Some(task) = task else {
                info!(worker_id, "queue closed, worker exiting");
                return;
            };

            self.active_tasks.fetch_add(1, Ordering::Relaxed);
            self.process_task(worker_id, task).await;
            self.active_tasks.fetch_sub(1, Ordering::Relaxed);
        }
    }

    async fn process_task(&self, worker_id: usize, task: Task) {
        match self.store.try_lease(task.id).await {
            Ok(true) => {}
            Ok(false) => {
                // Another worker owns the row
                debug!(worker_id, task_id = task.id, "lease lost, task dropped");
                return;
            }
            Err(e) => {
                // Leave the task untouched; the scheduler will see it again
                warn!(worker_id, task_id = task.id, error = %e, "lease failed");
                return;
            }
        }

        info!(worker_id, task_id = task.id, path = %task.source_path, "transcode started");
        let started = std::time::Instant::now();

        match self.driver.encode(&task).await {
            Ok(outcome) => {
                info!(worker_id, task_id = task.id, "transcode succeeded");

                match tokio::fs::metadata(&outcome.output_path).await {
                    Ok(meta) => {
                        let output_size = meta.len() as i64;
                        if let Err(e) = self.store.update_output_size(task.id, output_size).await {
                            warn!(task_id = task.id, error = %e, "output size write failed");
                        }
                        let saved = task.source_size - output_size;
                        if task.source_size > 0 && saved > 0 {
                            self.metrics.space_saved_bytes.inc_by(saved as f64);
                        }
                    }
                    Err(e) => {
                        warn!(task_id = task.id, error = %e, "published output stat failed")
                    }
                }

                if let Err(e) = self.store.update_progress(task.id, 100.0).await {
                    warn!(task_id = task.id, error = %e, "progress write failed");
                }
                if let Err(e) = self
                    .store
                    .update_status(task.id, TaskStatus::Completed, "transcode complete")
                    .await
                {
                    warn!(task_id = task.id, error = %e, "completion write failed");
                }

                self.metrics.transcode_success.inc();
                self.metrics
                    .transcode_duration_seconds
                    .observe(started.elapsed().as_secs_f64());
            }
            Err(e) => {
                let message = e.to_string();
                let classification = classify_error(&message);
                error!(
                    worker_id,
                    task_id = task.id,
                    category = classification.category,
                    detail = %tail_of(&message, 500),
                    "transcode failed"
                );

                let next_retry = task.retry_count + 1;
                if let Err(e) = self.store.increment_retry(task.id).await {
                    warn!(task_id = task.id, error = %e, "retry increment failed");
                }

                if classification.transient && next_retry < MAX_ATTEMPTS {
                    if let Err(e) = self.store.update_progress(task.id, 0.0).await {
                        warn!(task_id = task.id, error = %e, "progress reset failed");
                    }
                    let log = format!("{}: {}", classification.category, message);
                    if let Err(e) = self
                        .store
                        .update_status(task.id, TaskStatus::Pending, &log)
                        .await
                    {
                        warn!(task_id = task.id, error = %e, "requeue write failed");
                    }
                } else if let Err(e) = self
                    .store
                    .update_status(task.id, TaskStatus::Failed, &message)
                    .await
                {
                    warn!(task_id = task.id, error = %e, "failure write failed");
                }

                self.metrics.transcode_failed.inc();
            }
        }
    }
}

/// Work-window membership for a given hour.
///
/// `start < end` is the plain interval [start, end); `start >= end` wraps
/// midnight, covering [start, 24) plus [0, end). Equal bounds therefore
/// mean the window never closes.
pub fn is_within_window(hour: u8, start: u8, end: u8) -> bool {
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Worker target: the ceiling inside the window or under force-run,
/// zero otherwise.
pub fn target_worker_count_at(
    hour: u8,
    force_run: bool,
    max_workers: usize,
    start: u8,
    end: u8,
) -> usize {
    if force_run || is_within_window(hour, start, end) {
        max_workers
    } else {
        0
    }
}
