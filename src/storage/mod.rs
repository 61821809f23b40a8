//! SQLite storage layer -- pool, migrations, retention.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Store a JSON-serializable piece of engine state under `key`.
pub fn save_state<T: Serialize>(pool: &Pool, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)
        .with_context(|| format!("failed to serialize state '{}'", key))?;
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO engine_state (key, value_json, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET
            value_json = excluded.value_json,
            updated_at = excluded.updated_at",
        params![key, json],
    )?;
    Ok(())
}

/// Load the state stored under `key`, if any.
pub fn load_state<T: DeserializeOwned>(pool: &Pool, key: &str) -> Result<Option<T>> {
    let conn = pool.get()?;
    let json: Option<String> = conn
        .query_row(
            "SELECT value_json FROM engine_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    json.map(|j| {
        serde_json::from_str(&j).with_context(|| format!("corrupt state '{}'", key))
    })
    .transpose()
}

/// Rows removed by [`prune_history`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub trend_scores: usize,
    pub alert_log: usize,
    pub run_history: usize,
}

/// Delete ranking, alert and run history older than `days`. Baselines,
/// alert states and the dedup ledger are live state and are never pruned.
pub fn prune_history(pool: &Pool, days: u32) -> Result<PruneReport> {
    let cutoff = (Utc::now() - Duration::days(days as i64)).to_rfc3339();
    let conn = pool.get()?;

    let report = PruneReport {
        trend_scores: conn.execute(
            "DELETE FROM trend_scores WHERE created_at < ?1",
            params![cutoff],
        )?,
        alert_log: conn.execute("DELETE FROM alert_log WHERE created_at < ?1", params![cutoff])?,
        run_history: conn.execute(
            "DELETE FROM run_history WHERE started_at < ?1",
            params![cutoff],
        )?,
    };

    info!(
        days,
        trend_scores = report.trend_scores,
        alert_log = report.alert_log,
        run_history = report.run_history,
        "pruned history"
    );
    Ok(report)
}
