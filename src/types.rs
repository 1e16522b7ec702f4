//! Core types for the scheduler: errors, jobs, and tasks.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::parser::CronSchedule;

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, CronError>;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum CronError {
    /// Invalid cron expression
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),

    /// Invalid step value in a cron field
    #[error("invalid step value: {0}")]
    InvalidStep(String),

    /// Task with the same ID already scheduled
    #[error("task already exists: {0}")]
    DuplicateTaskId(String),

    /// Configured function name not present in the job registry
    #[error("no job registered under name: {0}")]
    UnknownJob(String),

    /// Time zone name not resolvable
    #[error("invalid time zone: {0}")]
    InvalidZone(String),

    /// Single-attempt deadline exceeded
    #[error("job execution timed out after {0}ms")]
    Timeout(u64),

    /// Job returned an error or panicked
    #[error("job execution failed: {0}")]
    JobFailure(String),

    /// Invalid task configuration entry
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Boxed future returned by job functions
pub type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// An executable unit of work with a stable identifier
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable identifier, unique within one scheduler
    fn id(&self) -> &str;

    /// Run one execution attempt
    async fn execute(&self) -> Result<()>;
}

/// A job backed by a plain async function or closure
///
/// # Examples
///
/// ```ignore
/// use litecron::FuncJob;
///
/// let job = FuncJob::new("backup", || async {
///     // do the work
///     Ok(())
/// });
/// ```
pub struct FuncJob {
    id: String,
    func: Box<dyn Fn() -> JobFuture + Send + Sync>,
}

impl FuncJob {
    /// Wrap an async function or closure as a job
    pub fn new<F, Fut>(id: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            func: Box::new(move || Box::pin(func()) as JobFuture),
        }
    }
}

#[async_trait]
impl Job for FuncJob {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self) -> Result<()> {
        (self.func)().await
    }
}

impl fmt::Debug for FuncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncJob").field("id", &self.id).finish()
    }
}

/// A scheduled task binding a job to its compiled schedule
///
/// Storage owns the task for its scheduled lifetime; the dispatcher briefly
/// takes it out on `tick`, runs the job, recomputes `next_run` and hands it
/// back. Clones share the job, the schedule and the `running` flag.
#[derive(Clone)]
pub struct Task {
    /// Unique task identifier
    pub id: String,
    /// The work to run at each fire time
    pub job: Arc<dyn Job>,
    /// Compiled schedule shared by every clone of this task
    pub schedule: Arc<CronSchedule>,
    /// Next scheduled fire time
    pub next_run: DateTime<Utc>,
    /// Previous fire time, if the task has run before
    pub prev_run: Option<DateTime<Utc>>,
    running: Arc<AtomicBool>,
}

impl Task {
    /// Create a task due at `next_run`
    pub fn new(
        id: impl Into<String>,
        job: Arc<dyn Job>,
        schedule: Arc<CronSchedule>,
        next_run: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            job,
            schedule,
            next_run,
            prev_run: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether an execution of this task is currently in flight
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the task for execution. Fails if an execution is already in
    /// flight, enforcing at-most-one concurrent run per task.
    pub(crate) fn try_claim(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the task after an execution finished
    pub(crate) fn release(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("expression", &self.schedule.expression())
            .field("next_run", &self.next_run)
            .field("prev_run", &self.prev_run)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{CronSchedule, ScheduleOptions};

    fn test_schedule() -> Arc<CronSchedule> {
        Arc::new(CronSchedule::parse("* * * * *", ScheduleOptions::default()).unwrap())
    }

    #[tokio::test]
    async fn test_func_job_executes() {
        let job = FuncJob::new("ok-job", || async { Ok(()) });
        assert_eq!(job.id(), "ok-job");
        assert!(job.execute().await.is_ok());
    }

    #[tokio::test]
    async fn test_func_job_propagates_error() {
        let job = FuncJob::new("failing", || async {
            Err(CronError::JobFailure("boom".to_string()))
        });
        let err = job.execute().await.unwrap_err();
        assert!(matches!(err, CronError::JobFailure(_)));
    }

    #[test]
    fn test_task_claim_release() {
        let job: Arc<dyn Job> = Arc::new(FuncJob::new("t", || async { Ok(()) }));
        let task = Task::new("t", job, test_schedule(), Utc::now());

        assert!(!task.is_running());
        assert!(task.try_claim());
        assert!(task.is_running());

        // second claim must fail while running
        assert!(!task.try_claim());

        task.release();
        assert!(!task.is_running());
        assert!(task.try_claim());
    }

    #[test]
    fn test_task_clone_shares_running_flag() {
        let job: Arc<dyn Job> = Arc::new(FuncJob::new("t", || async { Ok(()) }));
        let task = Task::new("t", job, test_schedule(), Utc::now());
        let clone = task.clone();

        assert!(task.try_claim());
        assert!(!clone.try_claim());
        clone.release();
        assert!(task.try_claim());
    }
}
