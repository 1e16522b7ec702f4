//! litecron - In-process cron-style task scheduler
//!
//! Compiles extended cron expressions (optional seconds and year fields,
//! `L` / `W` day qualifiers, macro shortcuts, IANA time zones) and fires
//! jobs at their scheduled instants with per-task timeout and retry
//! policies. Tasks live in one of two interchangeable storage backends: an
//! ordered min-heap queue or a dynamic hierarchical timing wheel.
//!
//! ## Quick Start
//!
//! ```ignore
//! use litecron::{ScheduleOptions, Scheduler, StorageKind};
//!
//! let scheduler = Scheduler::new(StorageKind::Heap);
//!
//! // add a task from a cron expression
//! scheduler
//!     .add_fn("heartbeat", "*/30 * * * * *", ScheduleOptions::new().with_seconds(), || async {
//!         // do the work
//!         Ok(())
//!     })
//!     .await?;
//!
//! // or build one fluently
//! scheduler.every(1).day().at("02:30").run(|| async { Ok(()) }).await?;
//!
//! scheduler.start();
//! // ...
//! scheduler.stop().await;
//! ```
//!
//! Declarative configuration goes through the process-wide job registry:
//!
//! ```ignore
//! use litecron::{register_job, Config, Scheduler};
//!
//! register_job("ping", || async { Ok(()) });
//! let config = Config::from_yaml_file("tasks.yaml")?;
//! let scheduler = Scheduler::default();
//! scheduler.load_config(&config).await?;
//! ```

mod builder;
mod config;
mod parser;
mod registry;
mod scheduler;
mod storage;
mod types;

pub use builder::ScheduleBuilder;
pub use config::{Config, TaskConfig};
pub use parser::{CronSchedule, FieldMatcher, ScheduleOptions, ScheduleZone};
pub use registry::{lookup_job, register_job, JobFn};
pub use scheduler::{Scheduler, SchedulerEvent};
pub use storage::{DynamicTimingWheel, StorageKind, TaskQueue, TaskStorage};
pub use types::{CronError, FuncJob, Job, JobFuture, Result, Task};
