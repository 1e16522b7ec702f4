//! Scheduler and dispatcher loop
//!
//! The scheduler owns a task storage backend and drives it from a single
//! dispatcher task: every tick it drains the due tasks and hands each one
//! to its own worker. Workers enforce at-most-one concurrent execution per
//! task, apply the schedule's timeout and retry policy, then recompute the
//! next fire time and return the task to storage. Job failures never stop
//! the scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Notify};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::interval;
use uuid::Uuid;

use crate::config::Config;
use crate::parser::{CronSchedule, ScheduleOptions};
use crate::registry::lookup_job;
use crate::storage::{create_storage, StorageKind, TaskStorage};
use crate::types::{CronError, FuncJob, Job, Result, Task};

const EVENT_CHANNEL_CAPACITY: usize = 100;
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Scheduler events for monitoring
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Scheduler started
    Started,
    /// Scheduler stopped
    Stopped,
    /// A worker picked up a due task
    JobStarted {
        task_id: String,
        execution_id: Uuid,
    },
    /// An attempt finished successfully
    JobCompleted {
        task_id: String,
        execution_id: Uuid,
    },
    /// An attempt failed
    JobFailed {
        task_id: String,
        execution_id: Uuid,
        error: String,
    },
    /// An attempt exceeded its deadline
    JobTimeout {
        task_id: String,
        execution_id: Uuid,
    },
    /// A fire was dropped because the previous execution is still running
    JobSkipped { task_id: String },
}

/// Cron scheduler over a pluggable storage backend
pub struct Scheduler {
    storage: Arc<dyn TaskStorage>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    tick_interval: Duration,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler backed by the given storage kind
    pub fn new(kind: StorageKind) -> Self {
        Self::with_storage(create_storage(kind))
    }

    /// Create a scheduler over a custom storage implementation
    pub fn with_storage(storage: Arc<dyn TaskStorage>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            event_tx,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            tick_interval: DEFAULT_TICK_INTERVAL,
            dispatcher: Mutex::new(None),
        }
    }

    /// Override the dispatcher tick interval (200 ms by default)
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        if !tick_interval.is_zero() {
            self.tick_interval = tick_interval;
        }
        self
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Schedule a job under the given cron expression
    ///
    /// Fails if the expression is invalid or a task with the job's ID is
    /// already scheduled.
    pub async fn add_task(
        &self,
        expression: &str,
        job: Arc<dyn Job>,
        options: ScheduleOptions,
    ) -> Result<Task> {
        let schedule = Arc::new(CronSchedule::parse(expression, options)?);
        let id = job.id().to_string();
        if id.is_empty() {
            return Err(CronError::InvalidConfig(
                "task id must not be empty".to_string(),
            ));
        }
        if self.storage.exists(&id).await {
            return Err(CronError::DuplicateTaskId(id));
        }

        let now = Utc::now();
        let next = schedule.next(&now).ok_or_else(|| {
            CronError::InvalidExpression(format!(
                "schedule '{expression}' has no upcoming fire time"
            ))
        })?;
        let task = Task::new(id.clone(), job, schedule, next);
        self.storage.add(task.clone()).await;

        tracing::info!("Added task {} ({}), next run {}", id, expression, task.next_run);
        Ok(task)
    }

    /// Schedule an async function under the given cron expression
    pub async fn add_fn<F, Fut>(
        &self,
        id: &str,
        expression: &str,
        options: ScheduleOptions,
        func: F,
    ) -> Result<Task>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.add_task(expression, Arc::new(FuncJob::new(id, func)), options)
            .await
    }

    /// Remove a task from the schedule; returns whether it was present
    pub async fn remove_task(&self, task: &Task) -> bool {
        let removed = self.storage.remove(&task.id).await;
        if removed {
            tracing::info!("Removed task {}", task.id);
        }
        removed
    }

    /// Snapshot of all scheduled tasks
    pub async fn list_tasks(&self) -> Vec<Task> {
        self.storage.list().await
    }

    /// Materialise every task of a validated configuration, resolving job
    /// functions through the process-wide registry
    pub async fn load_config(&self, config: &Config) -> Result<Vec<Task>> {
        config.validate()?;

        let mut tasks = Vec::with_capacity(config.tasks.len());
        for entry in &config.tasks {
            let options = entry.schedule_options()?;
            let func = lookup_job(&entry.func_name)
                .ok_or_else(|| CronError::UnknownJob(entry.func_name.clone()))?;
            let job: Arc<dyn Job> = Arc::new(FuncJob::new(&entry.id, move || func()));
            tasks.push(self.add_task(&entry.cron_expr, job, options).await?);
        }
        Ok(tasks)
    }

    /// Start the dispatcher loop. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let _ = self.event_tx.send(SchedulerEvent::Started);
        tracing::info!("Scheduler started");

        let storage = self.storage.clone();
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            let mut workers = JoinSet::new();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // reap finished workers so the set stays bounded
                        while workers.try_join_next().is_some() {}

                        let now = Utc::now();
                        for task in storage.tick(now).await {
                            workers.spawn(run_task(
                                storage.clone(),
                                event_tx.clone(),
                                task,
                            ));
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }

            // let outstanding executions finish before reporting stopped
            while workers.join_next().await.is_some() {}
            let _ = event_tx.send(SchedulerEvent::Stopped);
            tracing::info!("Scheduler stopped");
        });

        *self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Stop the dispatcher and wait for outstanding workers. Idempotent.
    pub async fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.shutdown.notify_one();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether the dispatcher loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(StorageKind::Heap)
    }
}

/// Execute one due task: claim it, run the retry loop, reschedule
async fn run_task(
    storage: Arc<dyn TaskStorage>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    mut task: Task,
) {
    if !task.try_claim() {
        tracing::debug!("Task {} is still running, skipping this fire", task.id);
        let _ = event_tx.send(SchedulerEvent::JobSkipped {
            task_id: task.id.clone(),
        });
        return;
    }

    let execution_id = Uuid::new_v4();
    let _ = event_tx.send(SchedulerEvent::JobStarted {
        task_id: task.id.clone(),
        execution_id,
    });

    let timeout = task.schedule.timeout();
    let attempts = task.schedule.retry() + 1;
    let mut succeeded = false;

    for attempt in 1..=attempts {
        match run_attempt(task.job.clone(), timeout).await {
            Ok(()) => {
                let _ = event_tx.send(SchedulerEvent::JobCompleted {
                    task_id: task.id.clone(),
                    execution_id,
                });
                succeeded = true;
                break;
            }
            Err(CronError::Timeout(ms)) => {
                tracing::warn!(
                    "Task {} attempt {}/{} timed out after {}ms",
                    task.id,
                    attempt,
                    attempts,
                    ms
                );
                let _ = event_tx.send(SchedulerEvent::JobTimeout {
                    task_id: task.id.clone(),
                    execution_id,
                });
            }
            Err(err) => {
                tracing::warn!(
                    "Task {} attempt {}/{} failed: {}",
                    task.id,
                    attempt,
                    attempts,
                    err
                );
                let _ = event_tx.send(SchedulerEvent::JobFailed {
                    task_id: task.id.clone(),
                    execution_id,
                    error: err.to_string(),
                });
            }
        }
    }

    if !succeeded {
        tracing::error!("Task {} exhausted all {} attempts", task.id, attempts);
    }

    // reschedule for the next occurrence regardless of the outcome
    let now = Utc::now();
    task.prev_run = Some(now);
    match task.schedule.next(&now) {
        Some(next) => {
            task.next_run = next;
            task.release();
            storage.add(task).await;
        }
        None => {
            tracing::warn!("Task {} has no upcoming fire time, dropping it", task.id);
            task.release();
        }
    }
}

/// Run a single attempt, bounded by the schedule's deadline when set
///
/// The job runs on its own task so a panic is contained and a timed-out
/// job may keep running in the background; the worker merely stops
/// waiting for it.
async fn run_attempt(job: Arc<dyn Job>, timeout: Duration) -> Result<()> {
    let handle = tokio::spawn(async move { job.execute().await });
    if timeout.is_zero() {
        return flatten_join(handle.await);
    }
    match tokio::time::timeout(timeout, handle).await {
        Ok(joined) => flatten_join(joined),
        Err(_) => Err(CronError::Timeout(timeout.as_millis() as u64)),
    }
}

fn flatten_join(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            Err(CronError::JobFailure(format!("job panicked: {err}")))
        }
        Err(err) => Err(CronError::JobFailure(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(id: &str, counter: Arc<AtomicUsize>) -> Arc<dyn Job> {
        Arc::new(FuncJob::new(id, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    }

    fn failing_job(id: &str, counter: Arc<AtomicUsize>) -> Arc<dyn Job> {
        Arc::new(FuncJob::new(id, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CronError::JobFailure("always fails".to_string()))
            }
        }))
    }

    fn due_task(id: &str, job: Arc<dyn Job>, options: ScheduleOptions) -> Task {
        let schedule = Arc::new(CronSchedule::parse("* * * * *", options).unwrap());
        Task::new(id, job, schedule, Utc::now() - chrono::Duration::seconds(1))
    }

    #[tokio::test]
    async fn test_add_task_and_list() {
        let scheduler = Scheduler::default();
        let counter = Arc::new(AtomicUsize::new(0));

        let task = scheduler
            .add_task(
                "*/5 * * * *",
                counting_job("job1", counter),
                ScheduleOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(task.id, "job1");

        let tasks = scheduler.list_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "job1");
    }

    #[tokio::test]
    async fn test_add_duplicate_id() {
        let scheduler = Scheduler::default();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .add_task(
                "* * * * *",
                counting_job("dup", counter.clone()),
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        let err = scheduler
            .add_task(
                "* * * * *",
                counting_job("dup", counter),
                ScheduleOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::DuplicateTaskId(_)));
    }

    #[tokio::test]
    async fn test_add_invalid_expression() {
        let scheduler = Scheduler::default();
        let counter = Arc::new(AtomicUsize::new(0));

        let result = scheduler
            .add_task(
                "not a cron",
                counting_job("bad", counter),
                ScheduleOptions::default(),
            )
            .await;
        assert!(result.is_err());
        assert!(scheduler.list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_task() {
        let scheduler = Scheduler::default();
        let counter = Arc::new(AtomicUsize::new(0));

        let task = scheduler
            .add_task(
                "* * * * *",
                counting_job("removable", counter),
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        assert!(scheduler.remove_task(&task).await);
        assert!(!scheduler.remove_task(&task).await);
        assert!(scheduler.list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let scheduler = Scheduler::default().with_tick_interval(Duration::from_millis(20));

        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_running());

        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());

        // the scheduler can be started again after a stop
        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_worker_runs_and_reschedules() {
        let storage = create_storage(StorageKind::Heap);
        let (event_tx, mut event_rx) = broadcast::channel(16);
        let counter = Arc::new(AtomicUsize::new(0));

        let task = due_task(
            "worker-test",
            counting_job("worker-test", counter.clone()),
            ScheduleOptions::default(),
        );
        let fired_at = task.next_run;
        run_task(storage.clone(), event_tx, task).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            SchedulerEvent::JobStarted { .. }
        ));
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            SchedulerEvent::JobCompleted { .. }
        ));

        // re-inserted with a recomputed fire time and prev_run set
        let tasks = storage.list().await;
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].next_run > fired_at);
        assert!(tasks[0].prev_run.is_some());
        assert!(!tasks[0].is_running());
    }

    #[tokio::test]
    async fn test_worker_retries_until_budget_exhausted() {
        let storage = create_storage(StorageKind::Heap);
        let (event_tx, mut event_rx) = broadcast::channel(16);
        let attempts = Arc::new(AtomicUsize::new(0));

        let task = due_task(
            "retry-test",
            failing_job("retry-test", attempts.clone()),
            ScheduleOptions::new().with_retry(2),
        );
        run_task(storage.clone(), event_tx, task).await;

        // one initial attempt plus two retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let mut failures = 0;
        while let Ok(event) = event_rx.try_recv() {
            if matches!(event, SchedulerEvent::JobFailed { .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 3);

        // still rescheduled after exhausting the budget
        assert!(storage.exists("retry-test").await);
    }

    #[tokio::test]
    async fn test_worker_timeout_does_not_block() {
        let storage = create_storage(StorageKind::Heap);
        let (event_tx, mut event_rx) = broadcast::channel(16);

        let job: Arc<dyn Job> = Arc::new(FuncJob::new("slow", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }));
        let task = due_task(
            "slow",
            job,
            ScheduleOptions::new().with_timeout(Duration::from_millis(20)),
        );

        let started = std::time::Instant::now();
        run_task(storage.clone(), event_tx, task).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let mut saw_timeout = false;
        while let Ok(event) = event_rx.try_recv() {
            if matches!(event, SchedulerEvent::JobTimeout { .. }) {
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
        assert!(storage.exists("slow").await);
    }

    #[tokio::test]
    async fn test_worker_recovers_from_panic() {
        let storage = create_storage(StorageKind::Heap);
        let (event_tx, mut event_rx) = broadcast::channel(16);

        let job: Arc<dyn Job> = Arc::new(FuncJob::new("panicky", || async {
            panic!("job blew up");
        }));
        let task = due_task("panicky", job, ScheduleOptions::default());
        run_task(storage.clone(), event_tx, task).await;

        let mut saw_failure = false;
        while let Ok(event) = event_rx.try_recv() {
            if let SchedulerEvent::JobFailed { error, .. } = event {
                assert!(error.contains("panicked"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        // the panic neither poisoned the worker nor lost the task
        assert!(storage.exists("panicky").await);
    }

    #[tokio::test]
    async fn test_worker_skips_when_already_running() {
        let storage = create_storage(StorageKind::Heap);
        let (event_tx, mut event_rx) = broadcast::channel(16);
        let counter = Arc::new(AtomicUsize::new(0));

        let task = due_task(
            "busy",
            counting_job("busy", counter.clone()),
            ScheduleOptions::default(),
        );
        assert!(task.try_claim());

        run_task(storage.clone(), event_tx, task.clone()).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            SchedulerEvent::JobSkipped { .. }
        ));
        task.release();
    }

    #[tokio::test]
    async fn test_scheduler_fires_due_task() {
        let scheduler = Scheduler::default().with_tick_interval(Duration::from_millis(50));
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .add_task(
                "* * * * * *",
                counting_job("every-second", counter.clone()),
                ScheduleOptions::new().with_seconds(),
            )
            .await
            .unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.stop().await;

        assert!(counter.load(Ordering::SeqCst) >= 1);
    }
}
