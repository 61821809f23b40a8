//! Per-entity alert state machine and the dedup ledger.
//!
//! ```text
//! NORMAL --score >= soft--> WATCH --score >= hard--> ALERTING --emit--> COOLDOWN
//!   ^                         |                                          |
//!   +--- 2 runs below soft ---+                                          |
//!   +------------------------ cooldown elapsed --------------------------+
//! ```
//!
//! A single evaluation may climb NORMAL -> WATCH -> ALERTING when the score
//! already clears the hard threshold. COOLDOWN ignores the score entirely.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::{debug, info};
use uuid::Uuid;

use super::{AlertRecord, AlertState, DedupKey, Delivery, Severity, StateTransition};
use crate::config::EngineConfig;
use crate::storage::Pool;
use crate::trend::TrendScore;

/// Consecutive evaluations below the soft threshold that end a WATCH.
pub const HYSTERESIS_RUNS: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct EntityAlert {
    state: AlertState,
    below_soft_runs: u32,
    /// First bucket start at which COOLDOWN is over.
    cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct AlertStateMachine {
    soft_threshold: f64,
    hard_threshold: f64,
    cooldown_span: Duration,
    entities: Mutex<HashMap<String, EntityAlert>>,
    /// Successful deliveries: key -> bucket the alert was delivered for.
    delivered: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
}

impl AlertStateMachine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            soft_threshold: config.soft_threshold,
            hard_threshold: config.hard_threshold,
            cooldown_span: config.cooldown_span(),
            entities: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, entity: &str) -> AlertState {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// Every entity that has left NORMAL at least once, sorted by id.
    pub fn states(&self) -> Vec<(String, AlertState)> {
        let entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = entities
            .iter()
            .map(|(id, e)| (id.clone(), e.state))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Feed one scored bucket. Returns an alert when the entity reaches
    /// ALERTING; the caller must hand it off and then call [`Self::finish`].
    /// An entity left in ALERTING by an interrupted run re-emits on its next
    /// evaluation.
    pub fn evaluate(&self, score: &TrendScore, source: &str) -> Option<AlertRecord> {
        let mut entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entities.entry(score.entity_id.clone()).or_default();
        let value = score.combined_score;
        let bucket = score.bucket_start;

        match entry.state {
            AlertState::Cooldown => {
                if entry.cooldown_until.map_or(true, |until| bucket >= until) {
                    debug!(entity = %score.entity_id, "COOLDOWN->NORMAL");
                    *entry = EntityAlert::default();
                }
                return None;
            }
            AlertState::Alerting => {
                return Some(self.record(score, source));
            }
            AlertState::Normal | AlertState::Watch => {}
        }

        if value < self.soft_threshold {
            entry.below_soft_runs += 1;
            if entry.state == AlertState::Watch && entry.below_soft_runs >= HYSTERESIS_RUNS {
                debug!(entity = %score.entity_id, "WATCH->NORMAL");
                *entry = EntityAlert::default();
            }
            return None;
        }

        entry.below_soft_runs = 0;
        if entry.state == AlertState::Normal {
            debug!(entity = %score.entity_id, score = value, "NORMAL->WATCH");
            entry.state = AlertState::Watch;
        }
        if value >= self.hard_threshold {
            info!(entity = %score.entity_id, score = value, "WATCH->ALERTING");
            entry.state = AlertState::Alerting;
            return Some(self.record(score, source));
        }
        None
    }

    fn record(&self, score: &TrendScore, source: &str) -> AlertRecord {
        AlertRecord {
            id: Uuid::new_v4(),
            entity_id: score.entity_id.clone(),
            source: source.to_string(),
            bucket_start: score.bucket_start,
            score: score.combined_score,
            z_score: score.z_score,
            count: score.count,
            severity: Severity::grade(score.combined_score, self.hard_threshold),
            state_transition: StateTransition {
                from: AlertState::Watch,
                to: AlertState::Alerting,
            },
            dedup_key: self.dedup_key(&score.entity_id, score.bucket_start),
            created_at: Utc::now(),
            delivery: Delivery::Pending,
        }
    }

    /// Close out an emitted alert: ALERTING -> COOLDOWN.
    pub fn finish(&self, entity: &str, bucket_start: DateTime<Utc>) {
        let mut entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entities.entry(entity.to_string()).or_default();
        if entry.state == AlertState::Alerting {
            entry.state = AlertState::Cooldown;
            entry.below_soft_runs = 0;
            entry.cooldown_until = Some(bucket_start + self.cooldown_span);
            debug!(entity, until = ?entry.cooldown_until, "ALERTING->COOLDOWN");
        }
    }

    pub fn dedup_key(&self, entity: &str, bucket_start: DateTime<Utc>) -> DedupKey {
        let span = self.cooldown_span.num_seconds().max(1);
        let rounded = bucket_start.timestamp().div_euclid(span) * span;
        DedupKey {
            entity_id: entity.to_string(),
            rounded_bucket: DateTime::<Utc>::from_timestamp(rounded, 0).unwrap_or_default(),
        }
    }

    /// True if `key` was already delivered within one cooldown span of
    /// `bucket_start`.
    pub fn is_duplicate(&self, key: &DedupKey, bucket_start: DateTime<Utc>) -> bool {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|at| (bucket_start - *at).abs() < self.cooldown_span)
    }

    /// Record a successful delivery and drop ledger entries that can no
    /// longer collide.
    pub fn mark_delivered(&self, key: &DedupKey, bucket_start: DateTime<Utc>) {
        let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        let horizon = key.rounded_bucket - self.cooldown_span;
        delivered.retain(|_, at| *at >= horizon);
        delivered.insert(key.clone(), bucket_start);
    }

    pub fn load(&self, pool: &Pool) -> Result<usize> {
        let conn = pool.get()?;

        let mut stmt =
            conn.prepare("SELECT entity_id, state, below_soft_runs, cooldown_until FROM alert_states")?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(1)?;
            let until: Option<i64> = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                EntityAlert {
                    state: AlertState::parse(&state).unwrap_or_default(),
                    below_soft_runs: row.get::<_, i64>(2)?.max(0) as u32,
                    cooldown_until: until.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)),
                },
            ))
        })?;
        let mut loaded = HashMap::new();
        for r in rows {
            let (id, entry) = r?;
            loaded.insert(id, entry);
        }
        let count = loaded.len();
        *self.entities.lock().unwrap_or_else(PoisonError::into_inner) = loaded;

        let mut stmt = conn
            .prepare("SELECT entity_id, rounded_bucket, delivered_bucket FROM delivered_alerts")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut ledger = HashMap::new();
        for r in rows {
            let (entity_id, rounded, at) = r?;
            let (Some(rounded_bucket), Some(at)) = (
                DateTime::<Utc>::from_timestamp(rounded, 0),
                DateTime::<Utc>::from_timestamp(at, 0),
            ) else {
                continue;
            };
            ledger.insert(
                DedupKey {
                    entity_id,
                    rounded_bucket,
                },
                at,
            );
        }
        *self.delivered.lock().unwrap_or_else(PoisonError::into_inner) = ledger;

        Ok(count)
    }

    pub fn persist(&self, pool: &Pool) -> Result<()> {
        let entities: Vec<(String, EntityAlert)> = self
            .entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let ledger: Vec<(DedupKey, DateTime<Utc>)> = self
            .delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let mut conn = pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO alert_states (entity_id, state, below_soft_runs, cooldown_until, updated_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))
                 ON CONFLICT(entity_id) DO UPDATE SET
                    state = excluded.state,
                    below_soft_runs = excluded.below_soft_runs,
                    cooldown_until = excluded.cooldown_until,
                    updated_at = excluded.updated_at",
            )?;
            for (id, e) in &entities {
                stmt.execute(params![
                    id,
                    e.state.as_str(),
                    e.below_soft_runs as i64,
                    e.cooldown_until.map(|t| t.timestamp()),
                ])?;
            }

            tx.execute("DELETE FROM delivered_alerts", [])?;
            let mut stmt = tx.prepare(
                "INSERT INTO delivered_alerts (entity_id, rounded_bucket, delivered_bucket)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (key, at) in &ledger {
                stmt.execute(params![
                    key.entity_id,
                    key.rounded_bucket.timestamp(),
                    at.timestamp()
                ])?;
            }
        }
        tx.commit().context("failed to persist alert state")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn machine() -> AlertStateMachine {
        AlertStateMachine::new(&EngineConfig {
            bucket_width_secs: 3600,
            soft_threshold: 2.0,
            hard_threshold: 3.5,
            cooldown_buckets: 6,
            ..EngineConfig::default()
        })
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap() + Duration::hours(h as i64)
    }

    fn score(entity: &str, h: u32, value: f64) -> TrendScore {
        TrendScore {
            entity_id: entity.to_string(),
            bucket_start: hour(h),
            count: 10,
            z_score: value,
            growth_rate: 0.0,
            velocity: 0.0,
            combined_score: value,
            rank: 0,
        }
    }

    #[test]
    fn test_escalation_through_watch() {
        let m = machine();
        assert!(m.evaluate(&score("gizmo", 0, 1.0), "reddit").is_none());
        assert_eq!(m.state("gizmo"), AlertState::Normal);

        assert!(m.evaluate(&score("gizmo", 1, 2.5), "reddit").is_none());
        assert_eq!(m.state("gizmo"), AlertState::Watch);

        let alert = m.evaluate(&score("gizmo", 2, 4.0), "reddit").unwrap();
        assert_eq!(alert.entity_id, "gizmo");
        assert_eq!(alert.source, "reddit");
        assert_eq!(alert.state_transition.to, AlertState::Alerting);
        assert_eq!(alert.severity, Severity::Moderate);
        assert_eq!(m.state("gizmo"), AlertState::Alerting);

        m.finish("gizmo", alert.bucket_start);
        assert_eq!(m.state("gizmo"), AlertState::Cooldown);
    }

    #[test]
    fn test_hard_score_from_normal_fires_in_one_evaluation() {
        let m = machine();
        let alert = m.evaluate(&score("gizmo", 0, 68.8), "reddit").unwrap();
        assert_eq!(alert.state_transition.to_string(), "WATCH->ALERTING");
        assert_eq!(alert.severity, Severity::Viral);
    }

    #[test]
    fn test_cooldown_suppresses_then_expires() {
        let m = machine();
        let alert = m.evaluate(&score("gizmo", 0, 9.0), "reddit").unwrap();
        m.finish("gizmo", alert.bucket_start);

        for h in 1..6 {
            assert!(m.evaluate(&score("gizmo", h, 50.0), "reddit").is_none());
            assert_eq!(m.state("gizmo"), AlertState::Cooldown);
        }

        // Six buckets after the alert the cooldown is over, regardless of score.
        assert!(m.evaluate(&score("gizmo", 6, 50.0), "reddit").is_none());
        assert_eq!(m.state("gizmo"), AlertState::Normal);
        assert!(m.evaluate(&score("gizmo", 7, 50.0), "reddit").is_some());
    }

    #[test]
    fn test_cooldown_longer_than_i32_buckets() {
        let m = AlertStateMachine::new(&EngineConfig {
            bucket_width_secs: 1,
            soft_threshold: 2.0,
            hard_threshold: 3.5,
            cooldown_buckets: 3_000_000_000,
            ..EngineConfig::default()
        });
        let mut fired = 0;
        for s in 0..6 {
            let mut spike = score("gizmo", 0, 50.0);
            spike.bucket_start += Duration::seconds(s);
            if let Some(alert) = m.evaluate(&spike, "reddit") {
                m.finish("gizmo", alert.bucket_start);
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(m.state("gizmo"), AlertState::Cooldown);
    }

    #[test]
    fn test_watch_needs_two_quiet_runs() {
        let m = machine();
        m.evaluate(&score("gizmo", 0, 2.5), "reddit");
        assert_eq!(m.state("gizmo"), AlertState::Watch);

        m.evaluate(&score("gizmo", 1, 1.0), "reddit");
        assert_eq!(m.state("gizmo"), AlertState::Watch);

        // A run back above soft resets the count.
        m.evaluate(&score("gizmo", 2, 2.1), "reddit");
        m.evaluate(&score("gizmo", 3, 1.0), "reddit");
        assert_eq!(m.state("gizmo"), AlertState::Watch);

        m.evaluate(&score("gizmo", 4, 0.5), "reddit");
        assert_eq!(m.state("gizmo"), AlertState::Normal);
    }

    #[test]
    fn test_unfinished_alert_is_emitted_again() {
        let m = machine();
        let first = m.evaluate(&score("gizmo", 0, 9.0), "reddit").unwrap();
        // Interrupted before hand-off: still ALERTING on the next run.
        let again = m.evaluate(&score("gizmo", 1, 1.0), "reddit").unwrap();
        assert_eq!(again.dedup_key, first.dedup_key);
        assert_ne!(again.id, first.id);
    }

    #[test]
    fn test_dedup_ledger() {
        let m = machine();
        let key = m.dedup_key("gizmo", hour(7));
        assert_eq!(key.rounded_bucket, hour(6));
        assert_eq!(m.dedup_key("gizmo", hour(11)), key);
        assert_ne!(m.dedup_key("gizmo", hour(12)), key);

        assert!(!m.is_duplicate(&key, hour(7)));
        m.mark_delivered(&key, hour(7));
        assert!(m.is_duplicate(&key, hour(7)));
        assert!(m.is_duplicate(&key, hour(11)));
        assert!(!m.is_duplicate(&m.dedup_key("widget", hour(7)), hour(7)));
    }

    #[test]
    fn test_persist_and_load() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let pool = crate::storage::open_pool(&dir.path().join("alerts.db"))?;

        let m = machine();
        let alert = m.evaluate(&score("gizmo", 0, 9.0), "reddit").unwrap();
        m.mark_delivered(&alert.dedup_key, alert.bucket_start);
        m.finish("gizmo", alert.bucket_start);
        m.evaluate(&score("widget", 0, 2.5), "rss");
        m.persist(&pool)?;

        let restored = machine();
        assert_eq!(restored.load(&pool)?, 2);
        assert_eq!(
            restored.states(),
            vec![
                ("gizmo".to_string(), AlertState::Cooldown),
                ("widget".to_string(), AlertState::Watch),
            ]
        );
        assert!(restored.is_duplicate(&alert.dedup_key, alert.bucket_start));
        assert!(restored.evaluate(&score("gizmo", 3, 9.0), "reddit").is_none());
        Ok(())
    }
}
