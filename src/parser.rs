//! Cron expression compiler and next-fire oracle
//!
//! Supports 5, 6, or 7 field expressions depending on the enabled options:
//! ```text
//! ┌───────────── second (0-59, with `with_seconds`)
//! │ ┌───────────── minute (0-59)
//! │ │ ┌───────────── hour (0-23)
//! │ │ │ ┌───────────── day of month (1-31)
//! │ │ │ │ ┌───────────── month (1-12)
//! │ │ │ │ │ ┌───────────── day of week (0-6, 0=Sunday)
//! │ │ │ │ │ │ ┌───────────── year (1970-2099, with `with_years`)
//! * * * * * * *
//! ```
//!
//! Special characters:
//! - `*` / `?` - any value
//! - `,` - value list separator (e.g., `1,3,5`)
//! - `-` - range (e.g., `1-5`)
//! - `/` - step (e.g., `*/5`); the step must evenly divide the field width
//! - `L` - last day of the month (day-of-month), or `nL` for the last
//!   weekday `n` of the month (day-of-week)
//! - `nW` - weekday (Mon-Fri) nearest to day `n` (day-of-month)
//!
//! Macro shortcuts (`@daily`, `@hourly`, ...) expand to the equivalent
//! five-field expression before field counting.

use std::collections::BTreeSet;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::types::{CronError, Result};

const SECOND_MIN: u32 = 0;
const SECOND_MAX: u32 = 59;
const MINUTE_MIN: u32 = 0;
const MINUTE_MAX: u32 = 59;
const HOUR_MIN: u32 = 0;
const HOUR_MAX: u32 = 23;
const DOM_MIN: u32 = 1;
const DOM_MAX: u32 = 31;
const MONTH_MIN: u32 = 1;
const MONTH_MAX: u32 = 12;
const DOW_MIN: u32 = 0;
const DOW_MAX: u32 = 6;
const YEAR_MIN: u32 = 1970;
const YEAR_MAX: u32 = 2099;

/// How far `next` searches past `after` when no year field bounds the
/// domain. Eight years covers the longest gap between leap days.
const SEARCH_HORIZON_YEARS: i32 = 8;

/// Compiled matcher for a single cron field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMatcher {
    /// Explicit set of allowed values
    Set(BTreeSet<u32>),
    /// `L` in day-of-month: the last day of the candidate month
    LastDayOfMonth,
    /// `nL` in day-of-week: the last occurrence of weekday `n` in the month
    LastWeekdayOfMonth(u32),
    /// `nW` in day-of-month: the weekday (Mon-Fri) nearest to day `n`
    NearestWeekday(u32),
}

/// Time zone a schedule is evaluated in
///
/// Defaults to the host's local zone, like classic cron; named IANA
/// zones come from `chrono-tz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleZone {
    /// The host's local time zone
    Local,
    /// A named IANA time zone
    Tz(Tz),
}

/// Options controlling how an expression is compiled and executed
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub(crate) seconds: bool,
    pub(crate) years: bool,
    pub(crate) zone: ScheduleZone,
    pub(crate) timeout: StdDuration,
    pub(crate) retry: u32,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            seconds: false,
            years: false,
            zone: ScheduleZone::Local,
            timeout: StdDuration::ZERO,
            retry: 0,
        }
    }
}

impl ScheduleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a leading seconds field
    pub fn with_seconds(mut self) -> Self {
        self.seconds = true;
        self
    }

    /// Accept a trailing year field
    pub fn with_years(mut self) -> Self {
        self.years = true;
        self
    }

    /// Evaluate the schedule in the given time zone instead of the
    /// host's local zone
    pub fn with_zone(mut self, zone: Tz) -> Self {
        self.zone = ScheduleZone::Tz(zone);
        self
    }

    /// Resolve an IANA zone name, e.g. `"America/New_York"`
    pub fn with_zone_name(self, name: &str) -> Result<Self> {
        let zone = name
            .parse::<Tz>()
            .map_err(|_| CronError::InvalidZone(name.to_string()))?;
        Ok(self.with_zone(zone))
    }

    /// Per-attempt execution deadline; zero means none
    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Additional attempts after the first failure
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }
}

/// A compiled cron schedule
///
/// Immutable after compilation and shared by every task that references it.
/// `next` and `matches` are pure and safe to call from any thread.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    seconds: BTreeSet<u32>,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    day_of_month: FieldMatcher,
    months: BTreeSet<u32>,
    day_of_week: FieldMatcher,
    years: BTreeSet<u32>,
    seconds_enabled: bool,
    years_enabled: bool,
    zone: ScheduleZone,
    timeout: StdDuration,
    retry: u32,
}

impl CronSchedule {
    /// Compile a cron expression under the given options
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use litecron::{CronSchedule, ScheduleOptions};
    ///
    /// // Every 5 minutes
    /// let schedule = CronSchedule::parse("*/5 * * * *", ScheduleOptions::default()).unwrap();
    ///
    /// // Every 30 seconds, seconds field enabled
    /// let schedule =
    ///     CronSchedule::parse("*/30 * * * * *", ScheduleOptions::new().with_seconds()).unwrap();
    ///
    /// // Last day of every month at midnight
    /// let schedule = CronSchedule::parse("0 0 L * *", ScheduleOptions::default()).unwrap();
    /// ```
    pub fn parse(expression: &str, options: ScheduleOptions) -> Result<Self> {
        let expanded = expand_macro(expression)?;
        let parts: Vec<&str> = expanded.split_whitespace().collect();

        let expected = 5 + usize::from(options.seconds) + usize::from(options.years);
        if parts.len() != expected {
            return Err(CronError::InvalidExpression(format!(
                "expected {} fields, got {}",
                expected,
                parts.len()
            )));
        }

        let mut idx = 0;
        let seconds = if options.seconds {
            idx += 1;
            parse_field(parts[0], SECOND_MIN, SECOND_MAX, "second")?
        } else {
            // seconds pinned to the top of the minute
            BTreeSet::from([0])
        };
        let minutes = parse_field(parts[idx], MINUTE_MIN, MINUTE_MAX, "minute")?;
        let hours = parse_field(parts[idx + 1], HOUR_MIN, HOUR_MAX, "hour")?;
        let day_of_month = parse_day_of_month(parts[idx + 2])?;
        let months = parse_field(parts[idx + 3], MONTH_MIN, MONTH_MAX, "month")?;
        let day_of_week = parse_day_of_week(parts[idx + 4])?;
        let years = if options.years {
            parse_field(parts[idx + 5], YEAR_MIN, YEAR_MAX, "year")?
        } else {
            BTreeSet::new()
        };

        Ok(Self {
            expression: expression.to_string(),
            seconds,
            minutes,
            hours,
            day_of_month,
            months,
            day_of_week,
            years,
            seconds_enabled: options.seconds,
            years_enabled: options.years,
            zone: options.zone,
            timeout: options.timeout,
            retry: options.retry,
        })
    }

    /// Original expression string
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Time zone the schedule is evaluated in
    pub fn zone(&self) -> ScheduleZone {
        self.zone
    }

    /// Per-attempt execution deadline; zero means none
    pub fn timeout(&self) -> StdDuration {
        self.timeout
    }

    /// Additional attempts after the first failure
    pub fn retry(&self) -> u32 {
        self.retry
    }

    /// Whether a seconds field was accepted
    pub fn seconds_enabled(&self) -> bool {
        self.seconds_enabled
    }

    /// Whether a trailing year field was accepted
    pub fn years_enabled(&self) -> bool {
        self.years_enabled
    }

    /// Check whether an instant satisfies every field constraint
    ///
    /// The instant is evaluated in the schedule's zone at one-second
    /// granularity. Day-of-month and day-of-week must both hold.
    pub fn matches(&self, at: &DateTime<Utc>) -> bool {
        match self.zone {
            ScheduleZone::Local => self.matches_in(&at.with_timezone(&Local)),
            ScheduleZone::Tz(tz) => self.matches_in(&at.with_timezone(&tz)),
        }
    }

    fn matches_in<Z: TimeZone>(&self, t: &DateTime<Z>) -> bool {
        self.seconds.contains(&t.second())
            && self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.months.contains(&t.month())
            && (!self.years_enabled || year_in(&self.years, t.year()))
            && self.day_matches(t)
    }

    /// The least instant strictly after `after` that matches the schedule
    ///
    /// Returns `None` when the year domain is exhausted (year field present
    /// and all its years have passed) or no match exists within the search
    /// horizon.
    pub fn next(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.zone {
            ScheduleZone::Local => self.next_in(after.with_timezone(&Local)),
            ScheduleZone::Tz(tz) => self.next_in(after.with_timezone(&tz)),
        }
    }

    fn next_in<Z: TimeZone>(&self, local: DateTime<Z>) -> Option<DateTime<Utc>> {
        let mut t = local.clone().with_nanosecond(0).unwrap_or(local.clone())
            + Duration::seconds(1);

        let max_year = if self.years_enabled {
            *self.years.iter().next_back()? as i32
        } else {
            local.year() + SEARCH_HORIZON_YEARS
        };

        // Walk forward field by field: whenever a coarse field disagrees,
        // jump to the next wall-clock boundary of that granularity. Jumps
        // are absolute-time additions, so a zone transition inside a jump
        // only shifts the landing point; the loop re-reads the wall clock
        // and re-checks every field after each move.
        loop {
            if t.year() > max_year {
                return None;
            }
            if self.years_enabled && !year_in(&self.years, t.year()) {
                t = next_day(&t);
                continue;
            }
            if !self.months.contains(&t.month()) {
                t = next_day(&t);
                continue;
            }
            if !self.day_matches(&t) {
                t = next_day(&t);
                continue;
            }
            if !self.hours.contains(&t.hour()) {
                t = next_hour(&t);
                continue;
            }
            if !self.minutes.contains(&t.minute()) {
                t = next_minute(&t);
                continue;
            }
            let sec = t.second();
            if !self.seconds.contains(&sec) {
                t = match self.seconds.range(sec + 1..).next() {
                    Some(&s) => t + Duration::seconds(i64::from(s - sec)),
                    None => next_minute(&t),
                };
                continue;
            }
            return Some(t.with_timezone(&Utc));
        }
    }

    /// Combined day predicate: day-of-month AND day-of-week
    fn day_matches<Z: TimeZone>(&self, t: &DateTime<Z>) -> bool {
        let (year, month, day) = (t.year(), t.month(), t.day());

        let dom_ok = match &self.day_of_month {
            FieldMatcher::Set(days) => days.contains(&day),
            FieldMatcher::LastDayOfMonth => last_day_of_month(year, month) == Some(day),
            FieldMatcher::NearestWeekday(n) => nearest_weekday(year, month, *n) == Some(day),
            // only legal in day-of-week, rejected at parse time
            FieldMatcher::LastWeekdayOfMonth(_) => false,
        };
        if !dom_ok {
            return false;
        }

        let weekday = t.weekday().num_days_from_sunday();
        match &self.day_of_week {
            FieldMatcher::Set(days) => days.contains(&weekday),
            FieldMatcher::LastWeekdayOfMonth(w) => {
                last_weekday_of_month(year, month, *w) == Some(day)
            }
            // only legal in day-of-month, rejected at parse time
            FieldMatcher::LastDayOfMonth | FieldMatcher::NearestWeekday(_) => false,
        }
    }
}

/// Expand a `@macro` shortcut into its five-field form
fn expand_macro(expression: &str) -> Result<&str> {
    if !expression.starts_with('@') {
        return Ok(expression);
    }
    match expression {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        "@minutely" => Ok("* * * * *"),
        other => Err(CronError::InvalidExpression(format!(
            "unknown macro: {other}"
        ))),
    }
}

/// Parse a plain set-valued cron field
fn parse_field(term: &str, min: u32, max: u32, name: &str) -> Result<BTreeSet<u32>> {
    if term == "*" || term == "?" {
        return Ok((min..=max).collect());
    }

    if term.contains(',') {
        let mut values = BTreeSet::new();
        for part in term.split(',') {
            values.extend(parse_field(part, min, max, name)?);
        }
        if values.is_empty() {
            return Err(CronError::InvalidExpression(format!(
                "no valid values in {name} field: {term}"
            )));
        }
        return Ok(values);
    }

    if term.contains('-') {
        let parts: Vec<&str> = term.split('-').collect();
        if parts.len() != 2 {
            return Err(CronError::InvalidExpression(format!(
                "invalid range in {name} field: {term}"
            )));
        }
        let start = parse_value(parts[0], min, max, name)?;
        let end = parse_value(parts[1], min, max, name)?;
        if start > end {
            return Err(CronError::InvalidExpression(format!(
                "range start greater than end in {name} field: {term}"
            )));
        }
        return Ok((start..=end).collect());
    }

    if term.contains('/') {
        let parts: Vec<&str> = term.split('/').collect();
        if parts.len() != 2 {
            return Err(CronError::InvalidExpression(format!(
                "invalid step in {name} field: {term}"
            )));
        }
        // the base term must parse but contributes no values; the emitted
        // set always strides from the field minimum
        validate_step_base(parts[0], min, max, name)?;
        let step: u32 = parts[1].parse().map_err(|_| {
            CronError::InvalidExpression(format!("invalid step in {name} field: {term}"))
        })?;
        if step == 0 {
            return Err(CronError::InvalidStep(format!(
                "step cannot be zero in {name} field: {term}"
            )));
        }
        let width = max - min + 1;
        if width % step != 0 {
            return Err(CronError::InvalidStep(format!(
                "step {step} does not evenly divide the {name} field width {width}"
            )));
        }
        return Ok((min..=max).step_by(step as usize).collect());
    }

    let value = parse_value(term, min, max, name)?;
    Ok(BTreeSet::from([value]))
}

/// Parse and range-check a single integer value
fn parse_value(term: &str, min: u32, max: u32, name: &str) -> Result<u32> {
    let value: u32 = term.parse().map_err(|_| {
        CronError::InvalidExpression(format!("invalid value in {name} field: {term}"))
    })?;
    if value < min || value > max {
        return Err(CronError::InvalidExpression(format!(
            "value {value} out of range ({min}-{max}) in {name} field"
        )));
    }
    Ok(value)
}

/// Validate the base of a `base/step` term: `*`, `?`, or an in-range value
fn validate_step_base(base: &str, min: u32, max: u32, name: &str) -> Result<()> {
    if base == "*" || base == "?" {
        return Ok(());
    }
    parse_value(base, min, max, name).map(|_| ())
}

/// Parse the day-of-month field, which additionally accepts `L` and `nW`
fn parse_day_of_month(term: &str) -> Result<FieldMatcher> {
    if term == "*"
        || term == "?"
        || term.contains(',')
        || term.contains('-')
        || term.contains('/')
    {
        return parse_field(term, DOM_MIN, DOM_MAX, "day of month").map(FieldMatcher::Set);
    }
    if term.contains('L') {
        if term == "L" {
            return Ok(FieldMatcher::LastDayOfMonth);
        }
        return Err(CronError::InvalidExpression(format!(
            "'L' must stand alone in the day of month field: {term}"
        )));
    }
    if term.contains('W') {
        let day = term
            .strip_suffix('W')
            .and_then(|d| d.parse::<u32>().ok())
            .filter(|d| (DOM_MIN..=DOM_MAX).contains(d))
            .ok_or_else(|| {
                CronError::InvalidExpression(format!(
                    "'W' requires a day of month between 1 and 31: {term}"
                ))
            })?;
        return Ok(FieldMatcher::NearestWeekday(day));
    }
    parse_field(term, DOM_MIN, DOM_MAX, "day of month").map(FieldMatcher::Set)
}

/// Parse the day-of-week field, which additionally accepts `nL`
fn parse_day_of_week(term: &str) -> Result<FieldMatcher> {
    if term == "*"
        || term == "?"
        || term.contains(',')
        || term.contains('-')
        || term.contains('/')
    {
        return parse_field(term, DOW_MIN, DOW_MAX, "day of week").map(FieldMatcher::Set);
    }
    if term.contains('L') {
        let weekday = term
            .strip_suffix('L')
            .and_then(|d| d.parse::<u32>().ok())
            .filter(|d| (DOW_MIN..=DOW_MAX).contains(d))
            .ok_or_else(|| {
                CronError::InvalidExpression(format!(
                    "'L' requires a weekday between 0 and 6 in the day of week field: {term}"
                ))
            })?;
        return Ok(FieldMatcher::LastWeekdayOfMonth(weekday));
    }
    if term.contains('W') {
        return Err(CronError::InvalidExpression(format!(
            "'W' is only valid in the day of month field: {term}"
        )));
    }
    parse_field(term, DOW_MIN, DOW_MAX, "day of week").map(FieldMatcher::Set)
}

fn year_in(years: &BTreeSet<u32>, year: i32) -> bool {
    u32::try_from(year).map(|y| years.contains(&y)).unwrap_or(false)
}

/// Jump to the next wall-clock minute boundary (absolute-time addition)
fn next_minute<Z: TimeZone>(t: &DateTime<Z>) -> DateTime<Z> {
    t.clone() + Duration::seconds(60 - i64::from(t.second()))
}

/// Jump to the next wall-clock hour boundary
fn next_hour<Z: TimeZone>(t: &DateTime<Z>) -> DateTime<Z> {
    t.clone() + Duration::seconds(3600 - 60 * i64::from(t.minute()) - i64::from(t.second()))
}

/// Jump to the next wall-clock midnight
fn next_day<Z: TimeZone>(t: &DateTime<Z>) -> DateTime<Z> {
    let elapsed =
        3600 * i64::from(t.hour()) + 60 * i64::from(t.minute()) + i64::from(t.second());
    t.clone() + Duration::seconds(86400 - elapsed)
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|d| d.day())
}

/// The weekday (Mon-Fri) nearest to day `day`, never leaving the month
fn nearest_weekday(year: i32, month: u32, day: u32) -> Option<u32> {
    let last = last_day_of_month(year, month)?;
    if day > last {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(match date.weekday() {
        Weekday::Sat => {
            if day > 1 {
                day - 1
            } else {
                day + 2
            }
        }
        Weekday::Sun => {
            if day < last {
                day + 1
            } else {
                day - 2
            }
        }
        _ => day,
    })
}

/// Day of month of the last occurrence of `weekday` (0=Sunday) in the month
fn last_weekday_of_month(year: i32, month: u32, weekday: u32) -> Option<u32> {
    let last = last_day_of_month(year, month)?;
    let date = NaiveDate::from_ymd_opt(year, month, last)?;
    let last_weekday = date.weekday().num_days_from_sunday();
    Some(last - (last_weekday + 7 - weekday) % 7)
}
