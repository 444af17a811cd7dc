//! Cron monitoring: check-in events reporting scheduled-job health.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::Map;

/// When a monitored job is expected to run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MonitorSchedule {
    /// A crontab expression, e.g. `"0 * * * *"`.
    Crontab { value: String },
    /// Every `value` units.
    Interval { value: u64, unit: IntervalUnit },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
}

/// Server-side expectations for one monitor slug.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub schedule: MonitorSchedule,
    /// Minutes of grace past the scheduled time before a miss is recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkin_margin: Option<u64>,
    /// Minutes a run may take before it counts as failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runtime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl MonitorConfig {
    pub fn new(schedule: MonitorSchedule) -> Self {
        MonitorConfig {
            schedule,
            checkin_margin: None,
            max_runtime: None,
            timezone: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    InProgress,
    Ok,
    Error,
}

/// One check-in reported for a monitor slug.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckInEvent {
    pub event_id: Uuid,
    /// Stable across the in-progress and terminal check-in of one run.
    pub check_in_id: Uuid,
    pub monitor_slug: String,
    pub status: MonitorStatus,
    /// Runtime of the finished job in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_config: Option<MonitorConfig>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub contexts: Map,
}

impl CheckInEvent {
    pub fn new(monitor_slug: impl Into<String>, status: MonitorStatus) -> Self {
        CheckInEvent {
            event_id: Uuid::new_v4(),
            check_in_id: Uuid::new_v4(),
            monitor_slug: monitor_slug.into(),
            status,
            duration: None,
            release: None,
            environment: None,
            monitor_config: None,
            contexts: Map::new(),
        }
    }
}

/// Wraps a scheduled job with check-in reporting, applied explicitly where
/// the job is registered.
///
/// `run` reports an in-progress check-in, executes the job, then reports
/// `ok` or, when the job panics, `error` before resuming the unwind.
#[derive(Clone, Debug)]
pub struct Monitor {
    slug: String,
    config: Option<MonitorConfig>,
}

impl Monitor {
    pub fn new(slug: impl Into<String>) -> Self {
        Monitor {
            slug: slug.into(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: MonitorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn run<F, T>(&self, job: F) -> T
    where
        F: FnOnce() -> T,
    {
        let check_in_id = crate::capture_check_in(
            &self.slug,
            MonitorStatus::InProgress,
            None,
            None,
            self.config.clone(),
        );
        let started = Instant::now();

        match catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => {
                crate::capture_check_in(
                    &self.slug,
                    MonitorStatus::Ok,
                    check_in_id,
                    Some(started.elapsed().as_secs_f64()),
                    None,
                );
                result
            }
            Err(panic) => {
                crate::capture_check_in(
                    &self.slug,
                    MonitorStatus::Error,
                    check_in_id,
                    Some(started.elapsed().as_secs_f64()),
                    None,
                );
                resume_unwind(panic)
            }
        }
    }
}

/// Runs `job` under a one-off [`Monitor`] for `slug`.
pub fn monitored<F, T>(slug: &str, config: Option<MonitorConfig>, job: F) -> T
where
    F: FnOnce() -> T,
{
    let mut monitor = Monitor::new(slug);
    if let Some(config) = config {
        monitor = monitor.with_config(config);
    }
    monitor.run(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_in_serializes_with_slug_and_status() {
        let mut event = CheckInEvent::new("nightly-report", MonitorStatus::InProgress);
        event.monitor_config = Some(MonitorConfig::new(MonitorSchedule::Crontab {
            value: "0 2 * * *".into(),
        }));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["monitor_slug"], "nightly-report");
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["monitor_config"]["schedule"]["type"], "crontab");
        assert!(json.get("duration").is_none());
    }

    #[test]
    fn interval_schedule_serializes_with_unit() {
        let schedule = MonitorSchedule::Interval {
            value: 4,
            unit: IntervalUnit::Hour,
        };
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["type"], "interval");
        assert_eq!(json["value"], 4);
        assert_eq!(json["unit"], "hour");
    }

    #[test]
    fn monitor_returns_job_result() {
        // no SDK initialized: check-ins are dropped, the job still runs
        let monitor = Monitor::new("adhoc");
        assert_eq!(monitor.run(|| 41 + 1), 42);
    }
}
