use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use crate::config::cron_schedule;

/// Cron-driven trigger for periodic refreshes.
#[derive(Debug, Clone)]
pub struct Scheduler {
    expr: String,
    schedule: CronSchedule,
}

impl Scheduler {
    pub fn new(cron_expr: &str) -> Result<Self> {
        let schedule = cron_schedule(cron_expr)?;
        Ok(Self {
            expr: cron_expr.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    /// Fire times within the next `hours`. A dry-run preview only.
    pub fn preview(&self, now: DateTime<Utc>, hours: u64) -> Vec<DateTime<Utc>> {
        let end = now + Duration::hours(hours as i64);
        self.schedule
            .after(&now)
            .take_while(|t| *t <= end)
            .collect()
    }
}
