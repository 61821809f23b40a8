//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS baselines (
            entity_id TEXT PRIMARY KEY,
            ewma_mean REAL NOT NULL,
            ewma_variance REAL NOT NULL,
            observation_count INTEGER NOT NULL,
            last_updated_bucket INTEGER,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS entity_momentum (
            entity_id TEXT PRIMARY KEY,
            previous_count INTEGER,
            previous_growth REAL NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS alert_states (
            entity_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            below_soft_runs INTEGER NOT NULL DEFAULT 0,
            cooldown_until INTEGER,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS delivered_alerts (
            entity_id TEXT NOT NULL,
            rounded_bucket INTEGER NOT NULL,
            delivered_bucket INTEGER NOT NULL,
            PRIMARY KEY (entity_id, rounded_bucket)
        );

        CREATE TABLE IF NOT EXISTS engine_state (
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS trend_scores (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            bucket_start INTEGER NOT NULL,
            count INTEGER NOT NULL,
            z_score REAL NOT NULL,
            growth_rate REAL NOT NULL,
            velocity REAL NOT NULL,
            combined_score REAL NOT NULL,
            rank INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS alert_log (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            source TEXT NOT NULL,
            bucket_start INTEGER NOT NULL,
            score REAL NOT NULL,
            z_score REAL NOT NULL,
            count INTEGER NOT NULL,
            severity TEXT NOT NULL,
            transition_from TEXT NOT NULL,
            transition_to TEXT NOT NULL,
            dedup_key TEXT NOT NULL,
            delivery TEXT NOT NULL,
            reason TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS run_history (
            id TEXT PRIMARY KEY,
            trigger TEXT NOT NULL,
            status TEXT NOT NULL,
            items_seen INTEGER NOT NULL DEFAULT 0,
            late_discarded INTEGER NOT NULL DEFAULT 0,
            buckets_closed INTEGER NOT NULL DEFAULT 0,
            entities_scored INTEGER NOT NULL DEFAULT 0,
            insufficient_data INTEGER NOT NULL DEFAULT 0,
            alerts_delivered INTEGER NOT NULL DEFAULT 0,
            alerts_suppressed INTEGER NOT NULL DEFAULT 0,
            alerts_failed INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_trend_scores_run ON trend_scores(run_id);
        CREATE INDEX IF NOT EXISTS idx_trend_scores_entity ON trend_scores(entity_id, id);
        CREATE INDEX IF NOT EXISTS idx_trend_scores_created ON trend_scores(created_at);
        CREATE INDEX IF NOT EXISTS idx_alert_log_created ON alert_log(created_at);
        CREATE INDEX IF NOT EXISTS idx_run_history_started ON run_history(started_at);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in [
            "baselines",
            "entity_momentum",
            "alert_states",
            "delivered_alerts",
            "engine_state",
            "trend_scores",
            "alert_log",
            "run_history",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "table {} should start empty", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
