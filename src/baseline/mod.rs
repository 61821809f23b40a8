//! Rolling per-entity baselines (EWMA mean and variance).
//!
//! Update rule for an observation `x` with decay `a`:
//!
//! ```text
//! mean'     = mean + a * (x - mean)
//! variance' = (1 - a) * (variance + a * (x - mean)^2)
//! ```
//!
//! Each entity's statistics sit behind their own lock. [`BaselineStore::observe`]
//! scores an observation against the pre-update statistics and only then folds
//! it in, so an observation never contributes to its own baseline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::storage::Pool;

#[derive(Debug, Error, PartialEq)]
pub enum BaselineError {
    #[error(
        "out-of-order baseline update for '{entity}': bucket {attempted} is not after {last}"
    )]
    OrderingViolation {
        entity: String,
        last: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
}

/// Rolling statistics for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineStat {
    pub ewma_mean: f64,
    pub ewma_variance: f64,
    pub observation_count: u64,
    pub last_updated_bucket: Option<DateTime<Utc>>,
}

impl BaselineStat {
    pub fn stddev(&self) -> f64 {
        self.ewma_variance.max(0.0).sqrt()
    }

    fn apply(&mut self, x: f64, alpha: f64) {
        if self.observation_count == 0 {
            self.ewma_mean = x;
            self.ewma_variance = 0.0;
        } else {
            let diff = x - self.ewma_mean;
            self.ewma_mean += alpha * diff;
            self.ewma_variance = (1.0 - alpha) * (self.ewma_variance + alpha * diff * diff);
        }
        self.observation_count += 1;
    }
}

/// Whether an entity has enough history to be scored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaselineState {
    InsufficientData { have: u64, need: u64 },
    Ready { mean: f64, stddev: f64 },
}

impl BaselineState {
    pub fn is_ready(&self) -> bool {
        matches!(self, BaselineState::Ready { .. })
    }
}

/// Owner of every entity's [`BaselineStat`].
#[derive(Debug)]
pub struct BaselineStore {
    alpha: f64,
    min_observations: u64,
    entries: RwLock<HashMap<String, Arc<Mutex<BaselineStat>>>>,
}

impl BaselineStore {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            alpha: config.ewma_alpha(),
            min_observations: config.min_observations as u64,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, entity: &str) -> Arc<Mutex<BaselineStat>> {
        if let Some(existing) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
        {
            return existing.clone();
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity.to_string())
            .or_default()
            .clone()
    }

    /// Snapshot of an entity's statistics (default when never observed).
    pub fn get(&self, entity: &str) -> BaselineStat {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(entity)
            .map(|stat| stat.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    pub fn state(&self, entity: &str) -> BaselineState {
        self.classify(&self.get(entity))
    }

    fn classify(&self, stat: &BaselineStat) -> BaselineState {
        if stat.observation_count < self.min_observations {
            BaselineState::InsufficientData {
                have: stat.observation_count,
                need: self.min_observations,
            }
        } else {
            BaselineState::Ready {
                mean: stat.ewma_mean,
                stddev: stat.stddev(),
            }
        }
    }

    /// Fold a closed bucket into the entity's baseline.
    pub fn update(
        &self,
        entity: &str,
        bucket_start: DateTime<Utc>,
        count: u64,
    ) -> Result<BaselineStat, BaselineError> {
        self.observe(entity, bucket_start, count, |_| ())
            .map(|(_, stat)| stat)
    }

    /// Atomically: check ordering, run `score` against the baseline as it
    /// stood before this bucket, fold the bucket in, advance
    /// `last_updated_bucket`. A rejected bucket leaves the baseline untouched
    /// and `score` is not called.
    pub fn observe<R>(
        &self,
        entity: &str,
        bucket_start: DateTime<Utc>,
        count: u64,
        score: impl FnOnce(BaselineState) -> R,
    ) -> Result<(R, BaselineStat), BaselineError> {
        let entry = self.entry(entity);
        let mut stat = entry.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = stat.last_updated_bucket {
            if bucket_start <= last {
                error!(entity, last = %last, attempted = %bucket_start, "BaselineOrderingViolation");
                return Err(BaselineError::OrderingViolation {
                    entity: entity.to_string(),
                    last,
                    attempted: bucket_start,
                });
            }
        }

        let scored = score(self.classify(&stat));
        stat.apply(count as f64, self.alpha);
        stat.last_updated_bucket = Some(bucket_start);

        Ok((scored, stat.clone()))
    }

    /// Entities with any recorded history.
    pub fn entities(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(String, BaselineStat)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|(id, stat)| {
                (
                    id.clone(),
                    stat.lock().unwrap_or_else(PoisonError::into_inner).clone(),
                )
            })
            .collect()
    }

    pub fn restore(&self, stats: impl IntoIterator<Item = (String, BaselineStat)>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for (id, stat) in stats {
            entries.insert(id, Arc::new(Mutex::new(stat)));
        }
    }

    /// Reload persisted baselines.
    pub fn load(&self, pool: &Pool) -> Result<usize> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT entity_id, ewma_mean, ewma_variance, observation_count, last_updated_bucket
             FROM baselines",
        )?;
        let rows = stmt.query_map([], |row| {
            let last: Option<i64> = row.get(4)?;
            Ok((
                row.get::<_, String>(0)?,
                BaselineStat {
                    ewma_mean: row.get(1)?,
                    ewma_variance: row.get(2)?,
                    observation_count: row.get::<_, i64>(3)?.max(0) as u64,
                    last_updated_bucket: last.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)),
                },
            ))
        })?;

        let mut stats = Vec::new();
        for r in rows {
            stats.push(r?);
        }
        let count = stats.len();
        self.restore(stats);
        info!(entities = count, "loaded baselines");
        Ok(count)
    }

    /// Write every baseline in one transaction.
    pub fn persist(&self, pool: &Pool) -> Result<usize> {
        let snapshot = self.snapshot();
        let mut conn = pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO baselines (entity_id, ewma_mean, ewma_variance, observation_count, last_updated_bucket, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
                 ON CONFLICT(entity_id) DO UPDATE SET
                    ewma_mean = excluded.ewma_mean,
                    ewma_variance = excluded.ewma_variance,
                    observation_count = excluded.observation_count,
                    last_updated_bucket = excluded.last_updated_bucket,
                    updated_at = excluded.updated_at",
            )?;
            for (id, stat) in &snapshot {
                stmt.execute(params![
                    id,
                    stat.ewma_mean,
                    stat.ewma_variance,
                    stat.observation_count as i64,
                    stat.last_updated_bucket.map(|b| b.timestamp()),
                ])?;
            }
        }
        tx.commit().context("Failed to persist baselines")?;
        debug!(entities = snapshot.len(), "persisted baselines");
        Ok(snapshot.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn store(window: u32, min_obs: u32) -> BaselineStore {
        BaselineStore::new(&EngineConfig {
            baseline_window_buckets: window,
            min_observations: min_obs,
            ..EngineConfig::default()
        })
    }

    fn hour(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap() + Duration::hours(n)
    }

    #[test]
    fn test_first_observation_seeds_mean() {
        let s = store(4, 3);
        let stat = s.update("gizmo", hour(0), 10).unwrap();
        assert_eq!(stat.ewma_mean, 10.0);
        assert_eq!(stat.ewma_variance, 0.0);
        assert_eq!(stat.observation_count, 1);
        assert_eq!(stat.last_updated_bucket, Some(hour(0)));
    }

    #[test]
    fn test_ewma_update_rule() {
        // alpha = 2 / (4 + 1) = 0.4
        let s = store(4, 3);
        s.update("gizmo", hour(0), 10).unwrap();
        let stat = s.update("gizmo", hour(1), 11).unwrap();
        assert!((stat.ewma_mean - 10.4).abs() < 1e-9);
        assert!((stat.ewma_variance - 0.24).abs() < 1e-9);

        let stat = s.update("gizmo", hour(2), 9).unwrap();
        assert!((stat.ewma_mean - 9.84).abs() < 1e-9);
        assert!((stat.ewma_variance - 0.6144).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_data_until_min_observations() {
        let s = store(4, 3);
        s.update("gizmo", hour(0), 10).unwrap();
        s.update("gizmo", hour(1), 12).unwrap();
        assert_eq!(
            s.state("gizmo"),
            BaselineState::InsufficientData { have: 2, need: 3 }
        );
        s.update("gizmo", hour(2), 11).unwrap();
        assert!(s.state("gizmo").is_ready());
    }

    #[test]
    fn test_unknown_entity_is_insufficient() {
        let s = store(4, 3);
        assert_eq!(
            s.state("nobody"),
            BaselineState::InsufficientData { have: 0, need: 3 }
        );
        assert!(s.is_empty());
    }

    #[test]
    fn test_out_of_order_update_is_rejected() {
        let s = store(4, 1);
        s.update("gizmo", hour(5), 10).unwrap();

        let err = s.update("gizmo", hour(4), 99).unwrap_err();
        assert_eq!(
            err,
            BaselineError::OrderingViolation {
                entity: "gizmo".to_string(),
                last: hour(5),
                attempted: hour(4),
            }
        );
        // Same bucket twice is also out of order.
        assert!(s.update("gizmo", hour(5), 10).is_err());

        let stat = s.get("gizmo");
        assert_eq!(stat.observation_count, 1);
        assert_eq!(stat.ewma_mean, 10.0);
    }

    #[test]
    fn test_observe_scores_before_update() {
        let s = store(4, 1);
        s.update("gizmo", hour(0), 10).unwrap();

        let (seen, stat) = s
            .observe("gizmo", hour(1), 50, |state| match state {
                BaselineState::Ready { mean, .. } => mean,
                BaselineState::InsufficientData { .. } => f64::NAN,
            })
            .unwrap();
        assert_eq!(seen, 10.0);
        assert!(stat.ewma_mean > 10.0);
    }

    #[test]
    fn test_rejected_observe_does_not_score() {
        let s = store(4, 1);
        s.update("gizmo", hour(3), 10).unwrap();
        let mut called = false;
        let result = s.observe("gizmo", hour(2), 10, |_| called = true);
        assert!(result.is_err());
        assert!(!called);
    }

    #[test]
    fn test_constant_series_has_zero_variance() {
        let s = store(4, 3);
        for h in 0..10 {
            s.update("flat", hour(h), 7).unwrap();
        }
        let stat = s.get("flat");
        assert_eq!(stat.ewma_mean, 7.0);
        assert_eq!(stat.stddev(), 0.0);
    }

    #[test]
    fn test_entities_are_independent() {
        let s = std::sync::Arc::new(store(4, 1));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let s = s.clone();
                std::thread::spawn(move || {
                    let id = format!("entity-{}", t);
                    for h in 0..50 {
                        s.update(&id, hour(h), h as u64).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.len(), 4);
        for id in s.entities() {
            assert_eq!(s.get(&id).observation_count, 50);
        }
    }

    #[test]
    fn test_persist_and_load() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let pool = crate::storage::open_pool(&dir.path().join("baselines.db"))?;

        let s = store(4, 3);
        s.update("gizmo", hour(0), 10)?;
        s.update("gizmo", hour(1), 12)?;
        s.update("widget", hour(1), 3)?;
        assert_eq!(s.persist(&pool)?, 2);
        // Second persist upserts rather than duplicating.
        s.update("gizmo", hour(2), 14)?;
        s.persist(&pool)?;

        let reloaded = store(4, 3);
        assert_eq!(reloaded.load(&pool)?, 2);
        assert_eq!(reloaded.get("gizmo"), s.get("gizmo"));
        assert_eq!(reloaded.get("widget").last_updated_bucket, Some(hour(1)));

        // Ordering is enforced across a reload.
        assert!(reloaded.update("gizmo", hour(2), 1).is_err());
        Ok(())
    }
}
