//! Scheduler
//!
//! Crontab(5)-style matching of pipeline schedules against UTC wall-clock
//! minutes. A tick starts every scheduled pipeline whose schedule matches the
//! current minute, at most once per pipeline and minute. Missed minutes are
//! not caught up.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use conduit_core::domain::pipeline::Schedule;
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::service::instance_service;
use crate::state::AppState;

const WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Search horizon of [`CronSchedule::next_after`]; covers leap-day schedules
const SEARCH_YEARS: i32 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid schedule field {field} '{value}': {reason}")]
pub struct ScheduleError {
    pub field: &'static str,
    pub value: String,
    pub reason: String,
}

/// Set of accepted values of one field; `None` accepts everything
type Field = Option<BTreeSet<u32>>;

/// A parsed, validated [`Schedule`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Field,
    hours: Field,
    days: Field,
    weekdays: Field,
    months: Field,
}

impl CronSchedule {
    pub fn parse(schedule: &Schedule) -> Result<Self, ScheduleError> {
        Ok(Self {
            minutes: parse_field("min", schedule.min.as_deref(), 0, 59, &[])?,
            hours: parse_field("hour", schedule.hour.as_deref(), 0, 23, &[])?,
            days: parse_field("day", schedule.day.as_deref(), 1, 31, &[])?,
            weekdays: parse_field("weekday", schedule.weekday.as_deref(), 0, 6, &WEEKDAYS)?,
            months: parse_field("month", schedule.month.as_deref(), 1, 12, &MONTHS)?,
        })
    }

    /// Whether the minute containing `t` matches
    ///
    /// A constrained day of month takes precedence; the weekday is only
    /// consulted when the day is unconstrained.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        accepts(&self.months, t.month())
            && self.day_matches(t.date_naive())
            && accepts(&self.hours, t.hour())
            && accepts(&self.minutes, t.minute())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if self.days.is_some() {
            accepts(&self.days, date.day())
        } else {
            accepts(&self.weekdays, date.weekday().num_days_from_sunday())
        }
    }

    /// First matching minute strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(after) + Duration::minutes(1);
        let limit = t + Duration::days(366 * i64::from(SEARCH_YEARS));

        while t <= limit {
            if !accepts(&self.months, t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = start_of_day(t)? + Duration::days(1);
                continue;
            }
            if !accepts(&self.hours, t.hour()) {
                t = truncate_to_minute(t) - Duration::minutes(i64::from(t.minute()))
                    + Duration::hours(1);
                continue;
            }
            if !accepts(&self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }

        None
    }
}

fn accepts(field: &Field, value: u32) -> bool {
    field.as_ref().is_none_or(|set| set.contains(&value))
}

/// Parses one field: `*`, numbers, names, `a-b` ranges and comma lists
fn parse_field(
    field: &'static str,
    raw: Option<&str>,
    min: u32,
    max: u32,
    names: &[&str],
) -> Result<Field, ScheduleError> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() || raw == "*" {
        return Ok(None);
    }

    let error = |reason: String| ScheduleError {
        field,
        value: raw.to_string(),
        reason,
    };

    let mut values = BTreeSet::new();
    for part in raw.split(',').map(str::trim) {
        let (lo, hi) = match part.split_once('-') {
            Some((lo, hi)) => (
                parse_value(lo, min, max, names).map_err(&error)?,
                parse_value(hi, min, max, names).map_err(&error)?,
            ),
            None => {
                let v = parse_value(part, min, max, names).map_err(&error)?;
                (v, v)
            }
        };

        if lo > hi {
            return Err(error(format!("range {} is reversed", part)));
        }

        for v in lo..=hi {
            if !values.insert(v) {
                return Err(error(format!("value {} is listed twice", v)));
            }
        }
    }

    Ok(Some(values))
}

fn parse_value(token: &str, min: u32, max: u32, names: &[&str]) -> Result<u32, String> {
    let token = token.trim();
    if token.is_empty() {
        return Err("empty value".to_string());
    }

    let lower = token.to_ascii_lowercase();
    if let Some(pos) = names.iter().position(|n| *n == lower) {
        return Ok(min + pos as u32);
    }

    let value: u32 = token
        .parse()
        .map_err(|_| format!("'{}' is not a number", token))?;
    if value < min || value > max {
        return Err(format!("{} is outside {}-{}", value, min, max));
    }
    Ok(value)
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t - Duration::seconds(i64::from(t.second())) - Duration::nanoseconds(i64::from(t.nanosecond()))
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(Utc.from_utc_datetime(&t.date_naive().and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

// =============================================================================
// Tick
// =============================================================================

/// Starts every scheduled pipeline matching the minute of `now`
///
/// Returns how many instances were started. Due pipelines start concurrently;
/// a failing pipeline is logged and does not stop the others.
pub async fn tick(state: &AppState, now: DateTime<Utc>) -> usize {
    let minute = truncate_to_minute(now);
    let mut starts = JoinSet::new();

    for entry in state.store.entries() {
        let config = entry.config();
        let Some(schedule) = config.spec.schedule.as_ref().filter(|s| !s.is_empty()) else {
            continue;
        };

        let cron = match CronSchedule::parse(schedule) {
            Ok(cron) => cron,
            Err(e) => {
                tracing::error!("Pipeline {} has an invalid schedule: {}", entry.name(), e);
                continue;
            }
        };

        if !cron.matches(minute) || !entry.claim_minute(minute) {
            continue;
        }

        let state = state.clone();
        let pipeline = entry.name().to_string();
        starts.spawn(async move {
            let result = instance_service::start_instance(&state, &pipeline).await;
            (pipeline, result)
        });
    }

    let mut started = 0;
    while let Some(joined) = starts.join_next().await {
        match joined {
            Ok((pipeline, Ok(instance))) => {
                tracing::info!(
                    "Scheduled start of {}:{} for {}",
                    pipeline,
                    instance.id,
                    minute
                );
                started += 1;
            }
            Ok((pipeline, Err(e))) => {
                tracing::error!("Scheduled start of {} failed: {}", pipeline, e);
            }
            Err(e) => tracing::error!("Scheduled start panicked: {}", e),
        }
    }

    started
}

/// Next scheduled start of a spec, if it has a schedule
pub fn next_run(schedule: Option<&Schedule>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = schedule.filter(|s| !s.is_empty())?;
    CronSchedule::parse(schedule).ok()?.next_after(after)
}

/// Runs [`tick`] forever at the given period
pub async fn run(state: AppState, period: std::time::Duration) {
    tracing::info!("Scheduler started (every {}s)", period.as_secs());

    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let started = tick(&state, Utc::now()).await;
        if started > 0 {
            tracing::debug!("Scheduler tick started {} instance(s)", started);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatedExecutor;
    use crate::store::Store;
    use conduit_core::domain::instance::InstanceState;
    use conduit_core::domain::pipeline::{
        JobTemplate, Pipeline, PipelineConfig, PipelineSpec, Task,
    };
    use std::sync::Arc;

    fn schedule(min: &str, hour: &str, day: &str, weekday: &str, month: &str) -> Schedule {
        let field = |v: &str| (!v.is_empty()).then(|| v.to_string());
        Schedule {
            min: field(min),
            hour: field(hour),
            day: field(day),
            weekday: field(weekday),
            month: field(month),
        }
    }

    fn at(ts: &str) -> DateTime<Utc> {
        ts.parse().unwrap()
    }

    fn next(s: Schedule, from: &str) -> DateTime<Utc> {
        CronSchedule::parse(&s).unwrap().next_after(at(from)).unwrap()
    }

    #[test]
    fn test_parse_fields() {
        let cron = CronSchedule::parse(&schedule("0,30", "9-11", "", "mon-fri", "jan,dec")).unwrap();
        assert_eq!(cron.minutes, Some(BTreeSet::from([0, 30])));
        assert_eq!(cron.hours, Some(BTreeSet::from([9, 10, 11])));
        assert_eq!(cron.days, None);
        assert_eq!(cron.weekdays, Some(BTreeSet::from([1, 2, 3, 4, 5])));
        assert_eq!(cron.months, Some(BTreeSet::from([1, 12])));
    }

    #[test]
    fn test_parse_rejects_bad_fields() {
        assert!(CronSchedule::parse(&schedule("60", "", "", "", "")).is_err());
        assert!(CronSchedule::parse(&schedule("", "", "0", "", "")).is_err());
        assert!(CronSchedule::parse(&schedule("1,1", "", "", "", "")).is_err());
        assert!(CronSchedule::parse(&schedule("0-10,5", "", "", "", "")).is_err());
        assert!(CronSchedule::parse(&schedule("", "5-2", "", "", "")).is_err());
        assert!(CronSchedule::parse(&schedule("", "", "", "funday", "")).is_err());
        assert!(CronSchedule::parse(&schedule("", "", "", "", "1,")).is_err());
        assert!(CronSchedule::parse(&schedule("*", " ", "", "", "")).is_ok());
    }

    #[test]
    fn test_day_takes_precedence_over_weekday() {
        // 2016-08-12 was a Friday
        let cron = CronSchedule::parse(&schedule("0", "0", "12", "mon", "")).unwrap();
        assert!(cron.matches(at("2016-08-12T00:00:00Z")));
        assert!(!cron.matches(at("2016-08-15T00:00:00Z")));

        let cron = CronSchedule::parse(&schedule("0", "0", "", "mon", "")).unwrap();
        assert!(cron.matches(at("2016-08-15T00:00:00Z")));
        assert!(!cron.matches(at("2016-08-12T00:00:00Z")));
    }

    #[test]
    fn test_matches_ignores_seconds() {
        let cron = CronSchedule::parse(&schedule("15", "", "", "", "")).unwrap();
        assert!(cron.matches(at("2016-08-11T10:15:59Z")));
        assert!(!cron.matches(at("2016-08-11T10:16:00Z")));
    }

    #[test]
    fn test_next_after() {
        assert_eq!(
            next(schedule("0", "0", "", "", ""), "2016-08-11T15:00:00Z"),
            at("2016-08-12T00:00:00Z")
        );
        assert_eq!(
            next(schedule("0", "0-1", "", "", ""), "2016-08-11T00:00:00Z"),
            at("2016-08-11T01:00:00Z")
        );
        assert_eq!(
            next(schedule("5,15,30", "10-12", "", "", ""), "2016-08-11T11:50:00Z"),
            at("2016-08-11T12:05:00Z")
        );
        assert_eq!(
            next(schedule("15", "0", "", "mon,wed", ""), "2016-08-12T10:30:00Z"),
            at("2016-08-15T00:15:00Z")
        );
        assert_eq!(
            next(schedule("", "", "12", "", ""), "2016-08-12T10:59:00Z"),
            at("2016-08-12T11:00:00Z")
        );
        assert_eq!(
            next(schedule("0", "0", "5", "", ""), "2016-08-10T12:00:00Z"),
            at("2016-09-05T00:00:00Z")
        );
        assert_eq!(
            next(schedule("15", "0", "15", "", ""), "2016-12-30T10:30:00Z"),
            at("2017-01-15T00:15:00Z")
        );
        assert_eq!(
            next(schedule("0", "0", "", "", "8,10"), "2016-08-31T12:00:00Z"),
            at("2016-10-01T00:00:00Z")
        );
        assert_eq!(
            next(schedule("0", "0", "", "", "sep"), "2016-08-11T12:00:00Z"),
            at("2016-09-01T00:00:00Z")
        );
        assert_eq!(
            next(schedule("0", "0", "29", "", "feb"), "2016-03-01T00:00:00Z"),
            at("2020-02-29T00:00:00Z")
        );
    }

    fn scheduled_spec(s: Schedule) -> PipelineSpec {
        PipelineSpec {
            schedule: Some(s),
            tasks: vec![Task {
                name: "run".to_string(),
                template: Some(JobTemplate {
                    image: "busybox".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn add_pipeline(state: &AppState, name: &str, spec: PipelineSpec) {
        state.store.insert(Pipeline {
            name: name.to_string(),
            uri: format!("file:///{}.yaml", name),
            config: PipelineConfig {
                hash: "h".to_string(),
                spec,
            },
        });
    }

    fn scheduled_state(s: Schedule) -> (AppState, Arc<SimulatedExecutor>) {
        let executor = Arc::new(SimulatedExecutor::new());
        let state = AppState::new(Store::new(), executor.clone());
        add_pipeline(&state, "hourly", scheduled_spec(s));
        (state, executor)
    }

    #[tokio::test]
    async fn test_tick_continues_past_failing_pipeline() {
        let (state, executor) = scheduled_state(schedule("0", "", "", "", ""));

        // a first stage without jobs cannot be started
        let mut broken = scheduled_spec(schedule("0", "", "", "", ""));
        broken.tasks[0].template = None;
        add_pipeline(&state, "broken", broken);

        assert_eq!(tick(&state, at("2016-08-11T10:00:00Z")).await, 1);

        assert!(state.store.get("broken").unwrap().instances().is_empty());
        let hourly = state.store.get("hourly").unwrap().instances();
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].state, InstanceState::Running);
        assert_eq!(executor.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_fires_once_per_minute() {
        let (state, executor) = scheduled_state(schedule("0", "", "", "", ""));

        assert_eq!(tick(&state, at("2016-08-11T10:00:05Z")).await, 1);
        assert_eq!(tick(&state, at("2016-08-11T10:00:45Z")).await, 0);
        assert_eq!(tick(&state, at("2016-08-11T10:01:00Z")).await, 0);
        assert_eq!(tick(&state, at("2016-08-11T11:00:00Z")).await, 1);

        let entry = state.store.get("hourly").unwrap();
        let ids: Vec<_> = entry.instances().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(executor.submissions().len(), 2);
    }

    #[tokio::test]
    async fn test_tick_skips_unscheduled_pipelines() {
        let (state, _executor) = scheduled_state(Schedule::default());
        assert_eq!(tick(&state, at("2016-08-11T10:00:00Z")).await, 0);
        assert!(next_run(Some(&Schedule::default()), at("2016-08-11T10:00:00Z")).is_none());
    }
}
