//! Fluent schedule builder
//!
//! Synthesises cron expressions from method chains and hands the result to
//! the scheduler:
//!
//! ```ignore
//! scheduler.every(5).minutes().run(|| async { Ok(()) }).await?;
//! scheduler.every(1).day().at("02:30").run(backup).await?;
//! scheduler.every(1).friday().at("17:00").run(summary).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use chrono_tz::Tz;

use crate::parser::ScheduleOptions;
use crate::scheduler::Scheduler;
use crate::types::{CronError, Result, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Weekday(u32),
}

const WEEKDAY_NAMES: [&str; 7] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
];

/// Chainable builder created by [`Scheduler::every`]
pub struct ScheduleBuilder<'a> {
    scheduler: &'a Scheduler,
    interval: u32,
    unit: Option<Unit>,
    at: Option<String>,
    id: Option<String>,
    options: ScheduleOptions,
}

impl Scheduler {
    /// Start building a schedule that repeats every `interval` units
    ///
    /// The interval only applies to second, minute, and hour units; the
    /// calendar units fire once per day, week, or month.
    pub fn every(&self, interval: u32) -> ScheduleBuilder<'_> {
        ScheduleBuilder {
            scheduler: self,
            interval: interval.max(1),
            unit: None,
            at: None,
            id: None,
            options: ScheduleOptions::new(),
        }
    }
}

macro_rules! unit_method {
    ($singular:ident, $plural:ident, $unit:expr) => {
        pub fn $singular(mut self) -> Self {
            self.unit = Some($unit);
            self
        }

        pub fn $plural(self) -> Self {
            self.$singular()
        }
    };
}

macro_rules! weekday_method {
    ($name:ident, $num:expr) => {
        pub fn $name(mut self) -> Self {
            self.unit = Some(Unit::Weekday($num));
            self
        }
    };
}

impl<'a> ScheduleBuilder<'a> {
    unit_method!(second, seconds, Unit::Second);
    unit_method!(minute, minutes, Unit::Minute);
    unit_method!(hour, hours, Unit::Hour);
    unit_method!(day, days, Unit::Day);
    unit_method!(week, weeks, Unit::Week);
    unit_method!(month, months, Unit::Month);

    weekday_method!(sunday, 0);
    weekday_method!(monday, 1);
    weekday_method!(tuesday, 2);
    weekday_method!(wednesday, 3);
    weekday_method!(thursday, 4);
    weekday_method!(friday, 5);
    weekday_method!(saturday, 6);

    /// Fire at a specific time of day, `"HH:MM"` or `"HH:MM:SS"`
    pub fn at(mut self, time_spec: &str) -> Self {
        self.at = Some(time_spec.to_string());
        self
    }

    /// Override the auto-generated task id
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Per-attempt execution deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_timeout(timeout);
        self
    }

    /// Additional attempts after the first failure
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.options = self.options.with_retry(retry);
        self
    }

    /// Evaluate the schedule in the given time zone
    pub fn with_zone(mut self, zone: Tz) -> Self {
        self.options = self.options.with_zone(zone);
        self
    }

    /// The cron expression this chain synthesises
    pub fn expression(&self) -> Result<String> {
        self.build().map(|(expression, _)| expression)
    }

    /// Register the built schedule with an async function as its job
    pub async fn run<F, Fut>(self, func: F) -> Result<Task>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (expression, options) = self.build()?;
        let id = self.id.clone().unwrap_or_else(|| self.auto_id());
        self.scheduler.add_fn(&id, &expression, options, func).await
    }

    fn build(&self) -> Result<(String, ScheduleOptions)> {
        let unit = self.unit.ok_or_else(|| {
            CronError::InvalidExpression(
                "schedule builder needs a time unit, e.g. every(5).minutes()".to_string(),
            )
        })?;
        let mut options = self.options.clone();
        let n = self.interval;

        let expression = match unit {
            Unit::Second => {
                options = options.with_seconds();
                if n == 1 {
                    "* * * * * *".to_string()
                } else {
                    format!("*/{n} * * * * *")
                }
            }
            Unit::Minute => {
                if n == 1 {
                    "* * * * *".to_string()
                } else {
                    format!("*/{n} * * * *")
                }
            }
            Unit::Hour => {
                if n == 1 {
                    "0 * * * *".to_string()
                } else {
                    format!("0 */{n} * * *")
                }
            }
            Unit::Day => match self.parse_time_spec()? {
                Some((hour, minute, Some(second))) => {
                    options = options.with_seconds();
                    format!("{second} {minute} {hour} * * *")
                }
                Some((hour, minute, None)) => format!("{minute} {hour} * * *"),
                None => "0 0 * * *".to_string(),
            },
            Unit::Week => match self.parse_time_spec()? {
                Some((hour, minute, Some(second))) => {
                    options = options.with_seconds();
                    format!("{second} {minute} {hour} * * 0")
                }
                Some((hour, minute, None)) => format!("{minute} {hour} * * 0"),
                None => "0 0 * * 0".to_string(),
            },
            Unit::Month => match self.parse_time_spec()? {
                Some((hour, minute, Some(second))) => {
                    options = options.with_seconds();
                    format!("{second} {minute} {hour} 1 * *")
                }
                Some((hour, minute, None)) => format!("{minute} {hour} 1 * *"),
                None => "0 0 1 * *".to_string(),
            },
            Unit::Weekday(weekday) => match self.parse_time_spec()? {
                Some((hour, minute, Some(second))) => {
                    options = options.with_seconds();
                    format!("{second} {minute} {hour} * * {weekday}")
                }
                Some((hour, minute, None)) => format!("{minute} {hour} * * {weekday}"),
                None => format!("0 0 * * {weekday}"),
            },
        };

        Ok((expression, options))
    }

    /// Parse the `at` spec into `(hour, minute, second)` components
    fn parse_time_spec(&self) -> Result<Option<(u32, u32, Option<u32>)>> {
        let Some(spec) = &self.at else {
            return Ok(None);
        };

        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(CronError::InvalidExpression(format!(
                "invalid time format: {spec}, expected HH:MM or HH:MM:SS"
            )));
        }

        let hour: u32 = parts[0]
            .parse()
            .ok()
            .filter(|h| *h <= 23)
            .ok_or_else(|| CronError::InvalidExpression(format!("invalid hour: {}", parts[0])))?;
        let minute: u32 = parts[1]
            .parse()
            .ok()
            .filter(|m| *m <= 59)
            .ok_or_else(|| {
                CronError::InvalidExpression(format!("invalid minute: {}", parts[1]))
            })?;
        let second = match parts.get(2) {
            Some(raw) => Some(raw.parse::<u32>().ok().filter(|s| *s <= 59).ok_or_else(
                || CronError::InvalidExpression(format!("invalid second: {raw}")),
            )?),
            None => None,
        };

        Ok(Some((hour, minute, second)))
    }

    fn auto_id(&self) -> String {
        let at_suffix = || {
            self.at
                .as_ref()
                .map(|spec| format!("-at-{}", spec.replace(':', "-")))
                .unwrap_or_default()
        };

        match self.unit {
            Some(Unit::Second) if self.interval == 1 => "every-second".to_string(),
            Some(Unit::Second) => format!("every-{}-seconds", self.interval),
            Some(Unit::Minute) if self.interval == 1 => "every-minute".to_string(),
            Some(Unit::Minute) => format!("every-{}-minutes", self.interval),
            Some(Unit::Hour) if self.interval == 1 => "every-hour".to_string(),
            Some(Unit::Hour) => format!("every-{}-hours", self.interval),
            Some(Unit::Day) => format!("daily{}", at_suffix()),
            Some(Unit::Week) => format!("weekly{}", at_suffix()),
            Some(Unit::Month) => format!("monthly{}", at_suffix()),
            Some(Unit::Weekday(weekday)) => format!(
                "{}{}",
                WEEKDAY_NAMES[weekday as usize % 7],
                at_suffix()
            ),
            None => "unnamed-task".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageKind;

    fn scheduler() -> Scheduler {
        Scheduler::new(StorageKind::Heap)
    }

    #[test]
    fn test_basic_units() {
        let s = scheduler();
        let cases: Vec<(ScheduleBuilder<'_>, &str)> = vec![
            (s.every(1).second(), "* * * * * *"),
            (s.every(10).seconds(), "*/10 * * * * *"),
            (s.every(1).minute(), "* * * * *"),
            (s.every(5).minutes(), "*/5 * * * *"),
            (s.every(1).hour(), "0 * * * *"),
            (s.every(2).hours(), "0 */2 * * *"),
            (s.every(1).day(), "0 0 * * *"),
            (s.every(1).week(), "0 0 * * 0"),
            (s.every(1).month(), "0 0 1 * *"),
        ];
        for (builder, expected) in cases {
            assert_eq!(builder.expression().unwrap(), expected);
        }
    }

    #[test]
    fn test_weekdays() {
        let s = scheduler();
        assert_eq!(s.every(1).sunday().expression().unwrap(), "0 0 * * 0");
        assert_eq!(s.every(1).monday().expression().unwrap(), "0 0 * * 1");
        assert_eq!(s.every(1).wednesday().expression().unwrap(), "0 0 * * 3");
        assert_eq!(s.every(1).saturday().expression().unwrap(), "0 0 * * 6");
    }

    #[test]
    fn test_at_time() {
        let s = scheduler();
        assert_eq!(
            s.every(1).day().at("10:30").expression().unwrap(),
            "30 10 * * *"
        );
        assert_eq!(
            s.every(1).day().at("10:30:45").expression().unwrap(),
            "45 30 10 * * *"
        );
        assert_eq!(
            s.every(1).friday().at("17:00").expression().unwrap(),
            "0 17 * * 5"
        );
        assert_eq!(
            s.every(1).month().at("06:15").expression().unwrap(),
            "15 6 1 * *"
        );
    }

    #[test]
    fn test_invalid_time_spec() {
        let s = scheduler();
        assert!(s.every(1).day().at("25:00").expression().is_err());
        assert!(s.every(1).day().at("10:75").expression().is_err());
        assert!(s.every(1).day().at("10").expression().is_err());
        assert!(s.every(1).day().at("10:30:99").expression().is_err());
    }

    #[test]
    fn test_missing_unit() {
        let s = scheduler();
        assert!(s.every(5).expression().is_err());
    }

    #[test]
    fn test_auto_ids() {
        let s = scheduler();
        assert_eq!(s.every(1).second().auto_id(), "every-second");
        assert_eq!(s.every(10).seconds().auto_id(), "every-10-seconds");
        assert_eq!(s.every(5).minutes().auto_id(), "every-5-minutes");
        assert_eq!(s.every(1).day().at("10:30").auto_id(), "daily-at-10-30");
        assert_eq!(s.every(1).week().auto_id(), "weekly");
        assert_eq!(s.every(1).tuesday().auto_id(), "tuesday");
        assert_eq!(
            s.every(1).friday().at("17:00").auto_id(),
            "friday-at-17-00"
        );
    }

    #[tokio::test]
    async fn test_run_registers_task() {
        let s = scheduler();
        let task = s
            .every(5)
            .minutes()
            .run(|| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(task.id, "every-5-minutes");
        assert_eq!(task.schedule.expression(), "*/5 * * * *");

        let tasks = s.list_tasks().await;
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_run_with_custom_id_and_policy() {
        let s = scheduler();
        let task = s
            .every(1)
            .day()
            .at("02:30")
            .with_id("nightly-backup")
            .with_timeout(Duration::from_secs(30))
            .with_retry(2)
            .run(|| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(task.id, "nightly-backup");
        assert_eq!(task.schedule.timeout(), Duration::from_secs(30));
        assert_eq!(task.schedule.retry(), 2);
    }

    #[tokio::test]
    async fn test_seconds_spec_enables_seconds_field() {
        let s = scheduler();
        let task = s
            .every(1)
            .day()
            .at("10:30:45")
            .run(|| async { Ok(()) })
            .await
            .unwrap();
        assert!(task.schedule.seconds_enabled());
        assert_eq!(task.schedule.expression(), "45 30 10 * * *");
    }
}
