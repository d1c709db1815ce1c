//! Next-run computation and the scheduling loop
//!
//! Every source carries a `next_sync`. Each tick picks the sources whose `next_sync`
//! has passed, starts a run for each while global permits remain, and moves their
//! `next_sync` forward. Sources beyond the concurrency cap keep their `next_sync` and
//! are picked up again on a later tick. Manual sources and webhook sources are never
//! triggered here.

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{IntegrationError, Result};
use crate::models::{
    DataSource, DataSourceType, ScheduleSpec, SourceFilter, SyncFrequency, SyncOptions,
    SyncSettings, SyncTrigger,
};
use crate::sync::Synchronizer;

/// Candidates examined before a schedule is declared unsatisfiable
const MAX_CANDIDATES: usize = 1_000;

fn interval(frequency: SyncFrequency) -> Option<Duration> {
    match frequency {
        SyncFrequency::RealTime => Some(Duration::zero()),
        SyncFrequency::EveryMinute => Some(Duration::minutes(1)),
        SyncFrequency::Every5Minutes => Some(Duration::minutes(5)),
        SyncFrequency::Every15Minutes => Some(Duration::minutes(15)),
        SyncFrequency::Every30Minutes => Some(Duration::minutes(30)),
        SyncFrequency::Hourly => Some(Duration::hours(1)),
        SyncFrequency::Daily => Some(Duration::days(1)),
        SyncFrequency::Weekly => Some(Duration::weeks(1)),
        SyncFrequency::Monthly | SyncFrequency::Manual => None,
    }
}

fn timezone(spec: &ScheduleSpec) -> Result<Tz> {
    spec.timezone
        .parse::<Tz>()
        .map_err(|e| IntegrationError::InvalidInput(format!("unknown timezone '{}': {e}", spec.timezone)))
}

fn cron_schedule(expression: &str) -> Result<Schedule> {
    Schedule::from_str(expression).map_err(|e| {
        IntegrationError::InvalidInput(format!("invalid cron expression '{expression}': {e}"))
    })
}

/// Check that a schedule parses and leaves at least one weekday and day of month
pub fn validate_schedule(spec: &ScheduleSpec) -> Result<()> {
    timezone(spec)?;
    if let Some(expression) = &spec.cron {
        cron_schedule(expression)?;
    }
    if let Some(day) = spec
        .excluded_days_of_month
        .iter()
        .find(|d| !(1..=31).contains(*d))
    {
        return Err(IntegrationError::InvalidInput(format!(
            "excluded day of month {day} is out of range"
        )));
    }
    if spec.excluded_weekdays.len() >= 7 {
        return Err(IntegrationError::InvalidInput(
            "schedule excludes every weekday".to_string(),
        ));
    }
    Ok(())
}

fn excluded(spec: &ScheduleSpec, at: &DateTime<Tz>) -> bool {
    spec.excluded_weekdays.contains(&at.weekday())
        || spec.excluded_days_of_month.contains(&at.day())
}

fn step(frequency: SyncFrequency, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match frequency {
        SyncFrequency::Monthly => from.checked_add_months(Months::new(1)),
        other => interval(other).map(|d| from + d),
    }
}

/// `after` itself when it is allowed, otherwise the next local midnight outside the exclusions
fn first_open_instant(spec: &ScheduleSpec, tz: Tz, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let mut candidate = after.with_timezone(&tz);
    for _ in 0..MAX_CANDIDATES {
        if !excluded(spec, &candidate) {
            return Ok(candidate.with_timezone(&Utc));
        }
        let next_day = candidate
            .date_naive()
            .succ_opt()
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .and_then(|midnight| {
                // a DST gap can swallow midnight
                tz.from_local_datetime(&midnight)
                    .earliest()
                    .or_else(|| tz.from_local_datetime(&(midnight + Duration::hours(1))).earliest())
            });
        match next_day {
            Some(next) => candidate = next,
            None => break,
        }
    }
    Err(IntegrationError::InvalidInput(
        "schedule has no run outside the exclusions".to_string(),
    ))
}

/// Next eligible run strictly derived from `after`; `None` for manual sources
pub fn next_run_after(
    settings: &SyncSettings,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    if settings.frequency == SyncFrequency::Manual {
        return Ok(None);
    }
    let default_spec = ScheduleSpec::default();
    let spec = settings.schedule.as_ref().unwrap_or(&default_spec);
    let tz = timezone(spec)?;

    if let Some(expression) = &spec.cron {
        let schedule = cron_schedule(expression)?;
        let local_after = tz.from_utc_datetime(&after.naive_utc());
        return schedule
            .after(&local_after)
            .take(MAX_CANDIDATES)
            .find(|candidate| !excluded(spec, candidate))
            .map(|candidate| Some(candidate.with_timezone(&Utc)))
            .ok_or_else(|| {
                IntegrationError::InvalidInput(format!(
                    "cron expression '{expression}' has no run outside the exclusions"
                ))
            });
    }

    if settings.frequency == SyncFrequency::RealTime {
        return first_open_instant(spec, tz, after).map(Some);
    }

    let mut candidate = after;
    for _ in 0..MAX_CANDIDATES {
        candidate = match step(settings.frequency, candidate) {
            Some(next) => next,
            None => return Ok(None),
        };
        if !excluded(spec, &candidate.with_timezone(&tz)) {
            return Ok(Some(candidate));
        }
    }
    Err(IntegrationError::InvalidInput(
        "schedule has no run outside the exclusions".to_string(),
    ))
}

fn schedulable(source: &DataSource) -> bool {
    source.status.can_sync()
        && source.sync_settings.frequency != SyncFrequency::Manual
        && source.source_type != DataSourceType::Webhook
}

/// Outcome of one scheduler tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sources a run was started for
    pub triggered: Vec<Uuid>,
    /// Due sources left for a later tick because every permit is taken
    pub deferred: Vec<Uuid>,
    /// Due sources that still have a run in flight or failed admission
    pub skipped: Vec<Uuid>,
}

pub struct Scheduler {
    synchronizer: Synchronizer,
}

impl Scheduler {
    pub fn new(synchronizer: Synchronizer) -> Self {
        Self { synchronizer }
    }

    /// Assign a `next_sync` to every schedulable source that lacks one
    pub async fn prime(&self, now: DateTime<Utc>) -> Result<usize> {
        let store = &self.synchronizer.context().store;
        let mut primed = 0;
        for source in store.list_sources(&SourceFilter::default()).await? {
            if !schedulable(&source) || source.next_sync.is_some() {
                continue;
            }
            match next_run_after(&source.sync_settings, now) {
                Ok(next) => {
                    store.set_next_sync(source.id, next).await?;
                    primed += 1;
                }
                Err(e) => warn!(source_id = %source.id, error = %e, "source has an unusable schedule"),
            }
        }
        Ok(primed)
    }

    /// Start runs for every source due at `now`
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let ctx = self.synchronizer.context();
        let mut due: Vec<DataSource> = ctx
            .store
            .list_sources(&SourceFilter::default())
            .await?
            .into_iter()
            .filter(|s| schedulable(s) && s.next_sync.is_some_and(|next| next <= now))
            .collect();
        due.sort_by_key(|s| s.next_sync);

        let mut report = TickReport::default();
        let mut budget = ctx.registry.available_permits();

        for source in due {
            if ctx.registry.is_busy(source.id) {
                debug!(source_id = %source.id, "source still syncing; skipping scheduled run");
                report.skipped.push(source.id);
                continue;
            }
            if budget == 0 {
                report.deferred.push(source.id);
                continue;
            }

            match self
                .synchronizer
                .start(source.id, SyncOptions::triggered_by(SyncTrigger::Scheduled))
                .await
            {
                Ok(sync_id) => {
                    budget -= 1;
                    report.triggered.push(source.id);
                    let next = next_run_after(&source.sync_settings, now).unwrap_or_else(|e| {
                        warn!(source_id = %source.id, error = %e, "cannot compute next run");
                        None
                    });
                    ctx.store.set_next_sync(source.id, next).await?;
                    debug!(source_id = %source.id, %sync_id, ?next, "scheduled sync started");
                }
                Err(e) => {
                    warn!(source_id = %source.id, error = %e, "scheduled sync not started");
                    report.skipped.push(source.id);
                }
            }
        }

        if !report.deferred.is_empty() {
            info!(
                deferred = report.deferred.len(),
                "concurrency cap reached; due sources stay queued"
            );
        }
        Ok(report)
    }

    /// Run the tick loop until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.synchronizer.context().config.scheduler_tick();
        tokio::spawn(async move {
            info!(tick_secs = period.as_secs(), "scheduler started");
            if let Err(e) = self.prime(Utc::now()).await {
                error!(error = %e, "failed to prime schedules");
            }

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(Utc::now()).await {
                            error!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
            info!("scheduler stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn settings(frequency: SyncFrequency, schedule: Option<ScheduleSpec>) -> SyncSettings {
        SyncSettings {
            frequency,
            schedule,
            ..SyncSettings::default()
        }
    }

    #[test]
    fn test_manual_never_scheduled() {
        let s = settings(SyncFrequency::Manual, None);
        assert_eq!(next_run_after(&s, Utc::now()).unwrap(), None);
    }

    #[test]
    fn test_fixed_intervals() {
        let start = at("2026-01-15T10:00:00Z");
        let hourly = settings(SyncFrequency::Hourly, None);
        assert_eq!(
            next_run_after(&hourly, start).unwrap(),
            Some(at("2026-01-15T11:00:00Z"))
        );

        let monthly = settings(SyncFrequency::Monthly, None);
        assert_eq!(
            next_run_after(&monthly, start).unwrap(),
            Some(at("2026-02-15T10:00:00Z"))
        );
    }

    #[test]
    fn test_cron_in_timezone() {
        let spec = ScheduleSpec {
            cron: Some("0 0 9 * * *".to_string()),
            timezone: "Europe/Berlin".to_string(),
            ..ScheduleSpec::default()
        };
        let s = settings(SyncFrequency::Daily, Some(spec));
        assert_eq!(
            next_run_after(&s, at("2026-01-15T00:00:00Z")).unwrap(),
            Some(at("2026-01-15T08:00:00Z"))
        );
    }

    #[test]
    fn test_cron_skips_excluded_weekdays() {
        let spec = ScheduleSpec {
            cron: Some("0 0 9 * * *".to_string()),
            timezone: "Europe/Berlin".to_string(),
            excluded_weekdays: vec![Weekday::Sat, Weekday::Sun],
            ..ScheduleSpec::default()
        };
        let s = settings(SyncFrequency::Daily, Some(spec));
        // Friday after the run: next is Monday
        assert_eq!(
            next_run_after(&s, at("2026-01-16T10:00:00Z")).unwrap(),
            Some(at("2026-01-19T08:00:00Z"))
        );
    }

    #[test]
    fn test_interval_skips_excluded_day_of_month() {
        let spec = ScheduleSpec {
            excluded_days_of_month: vec![1],
            ..ScheduleSpec::default()
        };
        let s = settings(SyncFrequency::Daily, Some(spec));
        assert_eq!(
            next_run_after(&s, at("2026-01-31T06:00:00Z")).unwrap(),
            Some(at("2026-02-02T06:00:00Z"))
        );
    }

    #[test]
    fn test_real_time_respects_exclusions() {
        let weekdays_only = ScheduleSpec {
            excluded_weekdays: vec![Weekday::Sat, Weekday::Sun],
            ..ScheduleSpec::default()
        };
        let s = settings(SyncFrequency::RealTime, Some(weekdays_only.clone()));

        let friday = at("2026-01-16T10:00:00Z");
        assert_eq!(next_run_after(&s, friday).unwrap(), Some(friday));

        // Saturday: held until Monday begins
        assert_eq!(
            next_run_after(&s, at("2026-01-17T10:00:00Z")).unwrap(),
            Some(at("2026-01-19T00:00:00Z"))
        );

        let berlin = ScheduleSpec {
            timezone: "Europe/Berlin".to_string(),
            ..weekdays_only
        };
        let s = settings(SyncFrequency::RealTime, Some(berlin));
        assert_eq!(
            next_run_after(&s, at("2026-01-17T10:00:00Z")).unwrap(),
            Some(at("2026-01-18T23:00:00Z"))
        );
    }

    #[test]
    fn test_invalid_schedules_rejected() {
        let bad_tz = ScheduleSpec {
            timezone: "Mars/Olympus".to_string(),
            ..ScheduleSpec::default()
        };
        assert!(validate_schedule(&bad_tz).is_err());

        let bad_cron = ScheduleSpec {
            cron: Some("every day".to_string()),
            ..ScheduleSpec::default()
        };
        assert!(validate_schedule(&bad_cron).is_err());

        let no_days = ScheduleSpec {
            excluded_weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            ..ScheduleSpec::default()
        };
        assert!(validate_schedule(&no_days).is_err());
        assert!(validate_schedule(&ScheduleSpec::default()).is_ok());
    }
}
