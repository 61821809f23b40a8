//! Trend scoring: z-score, growth, velocity and the ranked trend list.

pub mod history;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::baseline::{BaselineError, BaselineState, BaselineStore};
use crate::config::{EngineConfig, ScoreWeights};
use crate::storage::Pool;

/// Score of one entity for one closed bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendScore {
    pub entity_id: String,
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
    pub z_score: f64,
    pub growth_rate: f64,
    pub velocity: f64,
    pub combined_score: f64,
    /// 1-based position in the run's ranking; 0 until ranked.
    pub rank: u32,
}

/// Result of scoring one bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketScore {
    Scored(TrendScore),
    /// Too little history for a z-score; the bucket still fed the baseline.
    InsufficientData { have: u64, need: u64 },
}

/// Previous count and growth of an entity, for first and second differences.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Momentum {
    previous_count: Option<u64>,
    previous_growth: f64,
}

/// Computes trend scores against the baseline store.
#[derive(Debug)]
pub struct TrendScorer {
    weights: ScoreWeights,
    variance_floor: f64,
    momentum: Mutex<HashMap<String, Momentum>>,
}

impl TrendScorer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            weights: config.score_weights,
            variance_floor: config.variance_floor,
            momentum: Mutex::new(HashMap::new()),
        }
    }

    /// Score a closed bucket, then fold it into the entity's baseline.
    ///
    /// Buckets of one entity must arrive in increasing `bucket_start` order;
    /// anything else is rejected by the baseline store and changes nothing.
    pub fn score_bucket(
        &self,
        baselines: &BaselineStore,
        entity: &str,
        bucket_start: DateTime<Utc>,
        count: u64,
    ) -> Result<BucketScore, BaselineError> {
        let floor = self.variance_floor;
        let (z, _) = baselines.observe(entity, bucket_start, count, |state| match state {
            BaselineState::Ready { mean, stddev } => Ok((count as f64 - mean) / stddev.max(floor)),
            BaselineState::InsufficientData { have, need } => Err((have, need)),
        })?;

        let (growth, velocity) = {
            let mut momentum = self.momentum.lock().unwrap_or_else(PoisonError::into_inner);
            let m = momentum.entry(entity.to_string()).or_default();
            let growth = match m.previous_count {
                Some(prev) => (count as f64 - prev as f64) / (prev.max(1) as f64),
                None => 0.0,
            };
            let velocity = if m.previous_count.is_some() {
                growth - m.previous_growth
            } else {
                0.0
            };
            m.previous_count = Some(count);
            m.previous_growth = growth;
            (growth, velocity)
        };

        let z_score = match z {
            Ok(z) => z,
            Err((have, need)) => {
                debug!(entity, bucket = %bucket_start, have, need, "InsufficientDataState");
                return Ok(BucketScore::InsufficientData { have, need });
            }
        };

        let combined_score =
            self.weights.w_z * z_score + self.weights.w_g * growth + self.weights.w_v * velocity;

        Ok(BucketScore::Scored(TrendScore {
            entity_id: entity.to_string(),
            bucket_start,
            count,
            z_score,
            growth_rate: growth,
            velocity,
            combined_score,
            rank: 0,
        }))
    }

    /// Reload previous counts and growth rates.
    pub fn load(&self, pool: &Pool) -> Result<usize> {
        let conn = pool.get()?;
        let mut stmt =
            conn.prepare("SELECT entity_id, previous_count, previous_growth FROM entity_momentum")?;
        let rows = stmt.query_map([], |row| {
            let prev: Option<i64> = row.get(1)?;
            Ok((
                row.get::<_, String>(0)?,
                Momentum {
                    previous_count: prev.map(|p| p.max(0) as u64),
                    previous_growth: row.get(2)?,
                },
            ))
        })?;

        let mut momentum = self.momentum.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for r in rows {
            let (id, m) = r?;
            momentum.insert(id, m);
            count += 1;
        }
        info!(entities = count, "loaded trend momentum");
        Ok(count)
    }

    pub fn persist(&self, pool: &Pool) -> Result<()> {
        let snapshot: Vec<(String, Momentum)> = self
            .momentum
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, m)| (id.clone(), *m))
            .collect();

        let mut conn = pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO entity_momentum (entity_id, previous_count, previous_growth)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(entity_id) DO UPDATE SET
                    previous_count = excluded.previous_count,
                    previous_growth = excluded.previous_growth",
            )?;
            for (id, m) in &snapshot {
                stmt.execute(params![
                    id,
                    m.previous_count.map(|c| c as i64),
                    m.previous_growth
                ])?;
            }
        }
        tx.commit().context("Failed to persist trend momentum")?;
        Ok(())
    }
}

/// Order by combined score, then raw count (both descending), then entity
/// id, and assign 1-based ranks.
pub fn rank(mut scores: Vec<TrendScore>) -> Vec<TrendScore> {
    scores.sort_by(|a, b| {
        b.combined_score
            .total_cmp(&a.combined_score)
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    for (i, score) in scores.iter_mut().enumerate() {
        score.rank = i as u32 + 1;
    }
    scores
}

/// Aggregate view over a ranking.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendSummary {
    pub total_trends: usize,
    pub avg_score: f64,
    pub max_score: f64,
    pub above_soft: usize,
    pub above_hard: usize,
}

impl TrendSummary {
    pub fn from_ranking(ranking: &[TrendScore], soft: f64, hard: f64) -> Self {
        if ranking.is_empty() {
            return Self::default();
        }
        let scores = ranking.iter().map(|s| s.combined_score);
        Self {
            total_trends: ranking.len(),
            avg_score: scores.clone().sum::<f64>() / ranking.len() as f64,
            max_score: scores
                .clone()
                .max_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                .unwrap_or(0.0),
            above_soft: scores.clone().filter(|s| *s >= soft).count(),
            above_hard: scores.filter(|s| *s >= hard).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn engine(window: u32) -> EngineConfig {
        EngineConfig {
            baseline_window_buckets: window,
            min_observations: 3,
            variance_floor: 0.5,
            ..EngineConfig::default()
        }
    }

    fn hour(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap() + Duration::hours(n)
    }

    fn feed(scorer: &TrendScorer, store: &BaselineStore, entity: &str, counts: &[u64]) -> Vec<BucketScore> {
        counts
            .iter()
            .enumerate()
            .map(|(i, c)| scorer.score_bucket(store, entity, hour(i as i64), *c).unwrap())
            .collect()
    }

    fn z_of(score: &BucketScore) -> f64 {
        match score {
            BucketScore::Scored(s) => s.z_score,
            BucketScore::InsufficientData { .. } => panic!("expected a score"),
        }
    }

    #[test]
    fn test_constant_counts_converge_to_zero() {
        let cfg = engine(4);
        let (scorer, store) = (TrendScorer::new(&cfg), BaselineStore::new(&cfg));
        let scores = feed(&scorer, &store, "flat", &[20; 12]);
        for s in &scores[3..] {
            assert!(z_of(s).abs() < 1e-9);
        }
    }

    #[test]
    fn test_two_buckets_are_insufficient() {
        let cfg = engine(4);
        let (scorer, store) = (TrendScorer::new(&cfg), BaselineStore::new(&cfg));
        let scores = feed(&scorer, &store, "newbie", &[1, 40]);
        assert_eq!(scores[1], BucketScore::InsufficientData { have: 1, need: 3 });
        // The baseline still learned from both buckets.
        assert_eq!(store.get("newbie").observation_count, 2);
    }

    #[test]
    fn test_gizmo_spike() {
        let cfg = engine(4);
        let (scorer, store) = (TrendScorer::new(&cfg), BaselineStore::new(&cfg));
        let scores = feed(&scorer, &store, "gizmo", &[10, 11, 9, 10, 52]);

        assert!(matches!(scores[2], BucketScore::InsufficientData { .. }));
        assert!(z_of(&scores[3]).abs() < 1.0);

        let BucketScore::Scored(spike) = &scores[4] else {
            panic!("spike should be scored");
        };
        assert!(spike.z_score > 40.0, "z = {}", spike.z_score);
        assert!((spike.growth_rate - 4.2).abs() < 1e-9);
        assert!((spike.velocity - (4.2 - 1.0 / 9.0)).abs() < 1e-9);
        let z_part = cfg.score_weights.w_z * spike.z_score;
        assert!(z_part > 0.9 * spike.combined_score);
    }

    #[test]
    fn test_step_increase_decays_as_baseline_recenters() {
        let cfg = engine(4);
        let (scorer, store) = (TrendScorer::new(&cfg), BaselineStore::new(&cfg));
        let mut counts = vec![10u64; 6];
        counts.extend(std::iter::repeat(30).take(8));
        let z: Vec<f64> = feed(&scorer, &store, "step", &counts)[3..]
            .iter()
            .map(z_of)
            .collect();

        // Flat before the step, a jump at the step, then a steady decline.
        let step = 3;
        assert!(z[..step].iter().all(|v| v.abs() < 1e-9));
        for w in z[..=step].windows(2) {
            assert!(w[1] >= w[0]);
        }
        for w in z[step..].windows(2) {
            assert!(w[1] < w[0]);
        }
        assert!(z[step + cfg.baseline_window_buckets as usize] < cfg.soft_threshold);
    }

    #[test]
    fn test_velocity_detects_acceleration() {
        let cfg = engine(4);
        let (scorer, store) = (TrendScorer::new(&cfg), BaselineStore::new(&cfg));
        let scores = feed(&scorer, &store, "ramp", &[10, 10, 10, 20, 60]);
        let BucketScore::Scored(last) = &scores[4] else {
            panic!("scored");
        };
        assert!((last.growth_rate - 2.0).abs() < 1e-9);
        assert!((last.velocity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_growth_from_zero_uses_unit_denominator() {
        let cfg = engine(4);
        let (scorer, store) = (TrendScorer::new(&cfg), BaselineStore::new(&cfg));
        let scores = feed(&scorer, &store, "quiet", &[0, 0, 0, 5]);
        let BucketScore::Scored(last) = &scores[3] else {
            panic!("scored");
        };
        assert_eq!(last.growth_rate, 5.0);
        // Zero variance is floored, not divided by.
        assert_eq!(last.z_score, 5.0 / cfg.variance_floor);
    }

    #[test]
    fn test_out_of_order_bucket_leaves_state_unchanged() {
        let cfg = engine(4);
        let (scorer, store) = (TrendScorer::new(&cfg), BaselineStore::new(&cfg));
        feed(&scorer, &store, "gizmo", &[10, 11, 9]);
        let err = scorer.score_bucket(&store, "gizmo", hour(1), 500);
        assert!(err.is_err());
        let next = scorer.score_bucket(&store, "gizmo", hour(3), 10).unwrap();
        let BucketScore::Scored(s) = next else { panic!("scored") };
        // Growth is against the last accepted bucket (9), not the rejected one.
        assert!((s.growth_rate - 1.0 / 9.0).abs() < 1e-9);
    }

    fn score(entity: &str, combined: f64, count: u64) -> TrendScore {
        TrendScore {
            entity_id: entity.to_string(),
            bucket_start: hour(0),
            count,
            z_score: combined,
            growth_rate: 0.0,
            velocity: 0.0,
            combined_score: combined,
            rank: 0,
        }
    }

    #[test]
    fn test_rank_ordering_and_ties() {
        let ranked = rank(vec![
            score("b", 2.0, 10),
            score("a", 2.0, 10),
            score("c", 2.0, 50),
            score("d", 9.0, 1),
        ]);
        let order: Vec<(&str, u32)> = ranked.iter().map(|s| (s.entity_id.as_str(), s.rank)).collect();
        assert_eq!(order, vec![("d", 1), ("c", 2), ("a", 3), ("b", 4)]);
    }

    #[test]
    fn test_summary() {
        let ranked = rank(vec![score("a", 4.0, 1), score("b", 2.5, 1), score("c", 0.5, 1)]);
        let summary = TrendSummary::from_ranking(&ranked, 2.0, 3.5);
        assert_eq!(summary.total_trends, 3);
        assert_eq!(summary.max_score, 4.0);
        assert_eq!(summary.above_soft, 2);
        assert_eq!(summary.above_hard, 1);
        assert!((summary.avg_score - 7.0 / 3.0).abs() < 1e-9);
        assert_eq!(TrendSummary::from_ranking(&[], 2.0, 3.5), TrendSummary::default());
    }

    #[test]
    fn test_momentum_persists() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let pool = crate::storage::open_pool(&dir.path().join("momentum.db"))?;
        let cfg = engine(4);
        let (scorer, store) = (TrendScorer::new(&cfg), BaselineStore::new(&cfg));
        feed(&scorer, &store, "gizmo", &[10, 20]);
        scorer.persist(&pool)?;
        store.persist(&pool)?;

        let (scorer2, store2) = (TrendScorer::new(&cfg), BaselineStore::new(&cfg));
        assert_eq!(scorer2.load(&pool)?, 1);
        store2.load(&pool)?;
        let BucketScore::InsufficientData { .. } = scorer2.score_bucket(&store2, "gizmo", hour(2), 40)? else {
            panic!("still insufficient at two observations");
        };
        let next = scorer2.score_bucket(&store2, "gizmo", hour(3), 40)?;
        let BucketScore::Scored(s) = next else { panic!("scored") };
        assert_eq!(s.growth_rate, 0.0);
        assert_eq!(s.velocity, -1.0);
        Ok(())
    }
}
