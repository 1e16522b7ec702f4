//! Declarative task configuration
//!
//! A configuration document holds a `tasks` sequence; each entry names a
//! cron expression, execution policy, and a function registered in the
//! process-wide job registry:
//!
//! ```yaml
//! tasks:
//!   - id: nightly-report
//!     cron_expr: "0 2 * * *"
//!     timeout: 30000
//!     retry: 2
//!     location: America/New_York
//!     func_name: build_report
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::parser::ScheduleOptions;
use crate::registry::lookup_job;
use crate::types::{CronError, Result};

/// One scheduled task entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique task id
    pub id: String,

    /// Cron expression, interpreted under the entry's flags
    pub cron_expr: String,

    /// Per-attempt timeout in milliseconds; 0 or absent means none
    #[serde(default)]
    pub timeout: u64,

    /// Additional attempts after the first failure
    #[serde(default)]
    pub retry: u32,

    /// IANA zone name; empty means the host's local zone
    #[serde(default)]
    pub location: String,

    /// Accept a leading seconds field
    #[serde(default)]
    pub enable_seconds: bool,

    /// Accept a trailing year field
    #[serde(default)]
    pub enable_years: bool,

    /// Key into the job registry
    pub func_name: String,
}

impl TaskConfig {
    /// Translate the entry into compiler options
    pub fn schedule_options(&self) -> Result<ScheduleOptions> {
        let mut options = ScheduleOptions::new()
            .with_timeout(Duration::from_millis(self.timeout))
            .with_retry(self.retry);
        if self.enable_seconds {
            options = options.with_seconds();
        }
        if self.enable_years {
            options = options.with_years();
        }
        if !self.location.is_empty() {
            options = options.with_zone_name(&self.location)?;
        }
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(CronError::InvalidConfig(
                "task id must not be empty".to_string(),
            ));
        }
        if self.cron_expr.is_empty() {
            return Err(CronError::InvalidConfig(format!(
                "task {}: cron_expr must not be empty",
                self.id
            )));
        }
        if self.func_name.is_empty() {
            return Err(CronError::InvalidConfig(format!(
                "task {}: func_name must not be empty",
                self.id
            )));
        }
        if lookup_job(&self.func_name).is_none() {
            return Err(CronError::UnknownJob(self.func_name.clone()));
        }

        // resolves the zone and compiles the expression, surfacing
        // InvalidZone / InvalidExpression before any task is scheduled
        let options = self.schedule_options()?;
        crate::parser::CronSchedule::parse(&self.cron_expr, options)?;
        Ok(())
    }
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl Config {
    /// Load a configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Check every entry: required fields, registered function, zone and
    /// expression resolution, and id uniqueness within the document
    pub fn validate(&self) -> Result<()> {
        for entry in &self.tasks {
            entry.validate()?;
        }
        for (i, entry) in self.tasks.iter().enumerate() {
            if self.tasks[..i].iter().any(|other| other.id == entry.id) {
                return Err(CronError::DuplicateTaskId(entry.id.clone()));
            }
        }
        Ok(())
    }
}
