//! Execution history of refresh runs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::{RunReport, RunTrigger};
use crate::storage::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    /// Timed out or cancelled mid-flight.
    Aborted,
    /// Refused because another run held the lock.
    Conflict,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
            RunStatus::Conflict => "conflict",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => RunStatus::Running,
            "success" => RunStatus::Success,
            "aborted" => RunStatus::Aborted,
            "conflict" => RunStatus::Conflict,
            _ => RunStatus::Failed,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write (or overwrite) the history row of a run.
pub fn record_run(pool: &Pool, report: &RunReport) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO run_history
            (id, trigger, status, items_seen, late_discarded, buckets_closed, entities_scored,
             insufficient_data, alerts_delivered, alerts_suppressed, alerts_failed, error,
             started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            report.id.to_string(),
            report.trigger.as_str(),
            report.status.as_str(),
            report.items_seen as i64,
            report.late_discarded as i64,
            report.buckets_closed as i64,
            report.entities_scored as i64,
            report.insufficient_data as i64,
            report.alerts_delivered as i64,
            report.alerts_suppressed as i64,
            report.alerts_failed as i64,
            report.error,
            report.started_at.to_rfc3339(),
            report.finished_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Newest-first run history. Rankings are not part of the history rows.
pub fn list_runs(pool: &Pool, limit: usize) -> Result<Vec<RunReport>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, trigger, status, items_seen, late_discarded, buckets_closed, entities_scored,
                insufficient_data, alerts_delivered, alerts_suppressed, alerts_failed, error,
                started_at, finished_at
         FROM run_history ORDER BY started_at DESC LIMIT ?1",
    )?;

    let rows = stmt.query_map(params![limit as i64], |row| {
        let id: String = row.get(0)?;
        let trigger = match row.get::<_, String>(1)?.as_str() {
            "schedule" => RunTrigger::Schedule,
            "api" => RunTrigger::Api,
            _ => RunTrigger::Manual,
        };
        let status: String = row.get(2)?;
        let count = |idx: usize| -> rusqlite::Result<u64> { Ok(row.get::<_, i64>(idx)?.max(0) as u64) };
        let started_at: String = row.get(12)?;
        let finished_at: Option<String> = row.get(13)?;

        Ok(RunReport {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            trigger,
            status: RunStatus::parse(&status),
            items_seen: count(3)?,
            late_discarded: count(4)?,
            buckets_closed: count(5)? as usize,
            entities_scored: count(6)? as usize,
            insufficient_data: count(7)? as usize,
            alerts_delivered: count(8)? as usize,
            alerts_suppressed: count(9)? as usize,
            alerts_failed: count(10)? as usize,
            error: row.get(11)?,
            started_at: parse_time(&started_at).unwrap_or_default(),
            finished_at: finished_at.as_deref().and_then(parse_time),
            ranking: Vec::new(),
        })
    })?;

    let mut runs = Vec::new();
    for r in rows {
        runs.push(r?);
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: RunStatus, started_at: DateTime<Utc>) -> RunReport {
        RunReport {
            id: Uuid::new_v4(),
            trigger: RunTrigger::Manual,
            status,
            items_seen: 42,
            late_discarded: 2,
            buckets_closed: 3,
            entities_scored: 5,
            insufficient_data: 1,
            alerts_delivered: 1,
            alerts_suppressed: 0,
            alerts_failed: 0,
            error: None,
            started_at,
            finished_at: Some(started_at),
            ranking: Vec::new(),
        }
    }

    #[test]
    fn test_record_and_list_runs() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let pool = crate::storage::open_pool(&dir.path().join("runs.db"))?;

        let earlier = Utc::now() - chrono::Duration::minutes(15);
        let first = report(RunStatus::Success, earlier);
        let mut second = report(RunStatus::Conflict, Utc::now());
        second.error = Some("RunLockConflict".to_string());
        record_run(&pool, &first)?;
        record_run(&pool, &second)?;

        let runs = list_runs(&pool, 10)?;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[0].status, RunStatus::Conflict);
        assert_eq!(runs[0].error.as_deref(), Some("RunLockConflict"));
        assert_eq!(runs[1].items_seen, 42);
        assert_eq!(runs[1].status, RunStatus::Success);

        assert_eq!(list_runs(&pool, 1)?.len(), 1);
        Ok(())
    }
}
