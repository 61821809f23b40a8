//! Persisted rankings, kept as history for the dashboard.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::TrendScore;
use crate::storage::Pool;

/// Store one run's ranking.
pub fn save_ranking(pool: &Pool, run_id: Uuid, ranking: &[TrendScore]) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO trend_scores
                (run_id, entity_id, bucket_start, count, z_score, growth_rate, velocity, combined_score, rank, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        let created_at = Utc::now().to_rfc3339();
        for s in ranking {
            stmt.execute(params![
                run_id.to_string(),
                s.entity_id,
                s.bucket_start.timestamp(),
                s.count as i64,
                s.z_score,
                s.growth_rate,
                s.velocity,
                s.combined_score,
                s.rank,
                created_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn score_from_row(row: &Row<'_>) -> rusqlite::Result<TrendScore> {
    Ok(TrendScore {
        entity_id: row.get(0)?,
        bucket_start: DateTime::<Utc>::from_timestamp(row.get(1)?, 0).unwrap_or_default(),
        count: row.get::<_, i64>(2)?.max(0) as u64,
        z_score: row.get(3)?,
        growth_rate: row.get(4)?,
        velocity: row.get(5)?,
        combined_score: row.get(6)?,
        rank: row.get(7)?,
    })
}

/// Ranking written by the most recent run that produced one.
pub fn latest_ranking(pool: &Pool, limit: usize) -> Result<Vec<TrendScore>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT entity_id, bucket_start, count, z_score, growth_rate, velocity, combined_score, rank
         FROM trend_scores
         WHERE run_id = (SELECT run_id FROM trend_scores ORDER BY id DESC LIMIT 1)
         ORDER BY rank ASC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], score_from_row)?;
    let mut scores = Vec::new();
    for r in rows {
        scores.push(r?);
    }
    Ok(scores)
}

/// Newest-first score history of one entity.
pub fn entity_history(pool: &Pool, entity: &str, limit: usize) -> Result<Vec<TrendScore>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT entity_id, bucket_start, count, z_score, growth_rate, velocity, combined_score, rank
         FROM trend_scores
         WHERE entity_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![entity, limit as i64], score_from_row)?;
    let mut scores = Vec::new();
    for r in rows {
        scores.push(r?);
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn score(entity: &str, rank: u32, combined: f64) -> TrendScore {
        TrendScore {
            entity_id: entity.to_string(),
            bucket_start: Utc.with_ymd_and_hms(2026, 10, 1, 10, 0, 0).unwrap(),
            count: 12,
            z_score: combined,
            growth_rate: 0.5,
            velocity: 0.1,
            combined_score: combined,
            rank,
        }
    }

    #[test]
    fn test_latest_ranking_reads_newest_run() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let pool = crate::storage::open_pool(&dir.path().join("history.db"))?;

        save_ranking(&pool, Uuid::new_v4(), &[score("old", 1, 1.0)])?;
        save_ranking(
            &pool,
            Uuid::new_v4(),
            &[score("gizmo", 1, 9.0), score("widget", 2, 3.0)],
        )?;

        let latest = latest_ranking(&pool, 10)?;
        let ids: Vec<&str> = latest.iter().map(|s| s.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["gizmo", "widget"]);
        assert_eq!(latest[0], score("gizmo", 1, 9.0));

        assert_eq!(latest_ranking(&pool, 1)?.len(), 1);
        assert_eq!(entity_history(&pool, "old", 10)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_empty_history() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let pool = crate::storage::open_pool(&dir.path().join("empty.db"))?;
        assert!(latest_ranking(&pool, 10)?.is_empty());
        Ok(())
    }
}
