//! Alerting: per-entity state machine, safety gate, notifier hand-off and
//! the persisted alert log.

pub mod machine;
pub mod notifier;
pub mod safety;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::EntityBucket;
use crate::storage::Pool;

pub use machine::AlertStateMachine;
pub use notifier::{LogNotifier, MemoryNotifier, Notifier, NotifierError, WebhookNotifier};
pub use safety::{PatternClassifier, SafetyClassifier, SafetyGate, SafetyVerdict, SpamHeuristic};

/// Alert state of one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertState {
    #[default]
    Normal,
    Watch,
    /// Alert decided but not yet handed off.
    Alerting,
    Cooldown,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Normal => "NORMAL",
            AlertState::Watch => "WATCH",
            AlertState::Alerting => "ALERTING",
            AlertState::Cooldown => "COOLDOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NORMAL" => Some(AlertState::Normal),
            "WATCH" => Some(AlertState::Watch),
            "ALERTING" => Some(AlertState::Alerting),
            "COOLDOWN" => Some(AlertState::Cooldown),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: AlertState,
    pub to: AlertState,
}

impl std::fmt::Display for StateTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// `(entity_id, bucket_start rounded down to the cooldown span)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub entity_id: String,
    pub rounded_bucket: DateTime<Utc>,
}

impl DedupKey {
    /// Inverse of the `Display` form, `entity@unix_secs`.
    pub fn parse(s: &str) -> Option<Self> {
        let (entity, secs) = s.rsplit_once('@')?;
        Some(Self {
            entity_id: entity.to_string(),
            rounded_bucket: DateTime::<Utc>::from_timestamp(secs.parse().ok()?, 0)?,
        })
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.entity_id, self.rounded_bucket.timestamp())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Moderate,
    High,
    Viral,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::Viral => "viral",
        }
    }

    /// Grade a score relative to the hard threshold.
    pub fn grade(score: f64, hard_threshold: f64) -> Self {
        if score >= 2.0 * hard_threshold {
            Severity::Viral
        } else if score >= 1.5 * hard_threshold {
            Severity::High
        } else {
            Severity::Moderate
        }
    }
}

/// What happened to an alert after the state machine decided to fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Delivery {
    Pending,
    Delivered,
    Failed(String),
    /// SafetyViolation: never forwarded to the notifier.
    SuppressedSafety(String),
    SuppressedDuplicate,
}

impl Delivery {
    pub fn label(&self) -> &'static str {
        match self {
            Delivery::Pending => "pending",
            Delivery::Delivered => "delivered",
            Delivery::Failed(_) => "failed",
            Delivery::SuppressedSafety(_) => "suppressed_safety",
            Delivery::SuppressedDuplicate => "suppressed_duplicate",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Delivery::Failed(r) | Delivery::SuppressedSafety(r) => Some(r),
            _ => None,
        }
    }
}

/// One alert emission decision. Only the state machine creates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub entity_id: String,
    pub source: String,
    pub bucket_start: DateTime<Utc>,
    pub score: f64,
    pub z_score: f64,
    pub count: u64,
    pub severity: Severity,
    pub state_transition: StateTransition,
    pub dedup_key: DedupKey,
    pub created_at: DateTime<Utc>,
    pub delivery: Delivery,
}

/// Run an alert through the safety gate, dedup ledger and notifier, then
/// move the entity into cooldown. The returned record carries the outcome.
///
/// `bucket` is the scored bucket; a flag set while its items were ingested
/// suppresses the alert even when no kept sample shows the offending text.
pub async fn dispatch(
    machine: &AlertStateMachine,
    gate: &SafetyGate,
    notifier: &dyn Notifier,
    mut record: AlertRecord,
    bucket: Option<&EntityBucket>,
) -> AlertRecord {
    let verdict = match bucket.and_then(|b| b.flagged.as_deref()) {
        Some(reason) => SafetyVerdict::Violation(reason.to_string()),
        None => gate.check(
            &record.entity_id,
            bucket.map(|b| b.samples.as_slice()).unwrap_or(&[]),
        ),
    };
    if let SafetyVerdict::Violation(reason) = verdict {
        warn!(entity = %record.entity_id, %reason, "SafetyViolation: alert suppressed");
        record.delivery = Delivery::SuppressedSafety(reason);
    } else if machine.is_duplicate(&record.dedup_key, record.bucket_start) {
        info!(entity = %record.entity_id, key = %record.dedup_key, "duplicate alert suppressed");
        record.delivery = Delivery::SuppressedDuplicate;
    } else {
        match notifier.deliver(&record).await {
            Ok(()) => {
                machine.mark_delivered(&record.dedup_key, record.bucket_start);
                record.delivery = Delivery::Delivered;
            }
            Err(e) => {
                warn!(entity = %record.entity_id, error = %e, "NotifierDeliveryError");
                record.delivery = Delivery::Failed(e.to_string());
            }
        }
    }
    machine.finish(&record.entity_id, record.bucket_start);
    record
}

/// Append a record to the alert log.
pub fn record_alert(pool: &Pool, record: &AlertRecord) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO alert_log
            (id, entity_id, source, bucket_start, score, z_score, count, severity,
             transition_from, transition_to, dedup_key, delivery, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            record.id.to_string(),
            record.entity_id,
            record.source,
            record.bucket_start.timestamp(),
            record.score,
            record.z_score,
            record.count as i64,
            record.severity.as_str(),
            record.state_transition.from.as_str(),
            record.state_transition.to.as_str(),
            record.dedup_key.to_string(),
            record.delivery.label(),
            record.delivery.reason(),
            record.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Newest-first entries of the alert log.
pub fn list_alerts(pool: &Pool, limit: usize) -> Result<Vec<AlertRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, entity_id, source, bucket_start, score, z_score, count, severity,
                transition_from, transition_to, delivery, reason, created_at, dedup_key
         FROM alert_log ORDER BY created_at DESC, rowid DESC LIMIT ?1",
    )?;

    let rows = stmt.query_map(params![limit as i64], |row| {
        let id_str: String = row.get(0)?;
        let entity_id: String = row.get(1)?;
        let bucket_start = DateTime::<Utc>::from_timestamp(row.get(3)?, 0).unwrap_or_default();
        let severity = match row.get::<_, String>(7)?.as_str() {
            "viral" => Severity::Viral,
            "high" => Severity::High,
            _ => Severity::Moderate,
        };
        let from: String = row.get(8)?;
        let to: String = row.get(9)?;
        let status: String = row.get(10)?;
        let reason: Option<String> = row.get(11)?;
        let delivery = match status.as_str() {
            "delivered" => Delivery::Delivered,
            "failed" => Delivery::Failed(reason.unwrap_or_default()),
            "suppressed_safety" => Delivery::SuppressedSafety(reason.unwrap_or_default()),
            "suppressed_duplicate" => Delivery::SuppressedDuplicate,
            _ => Delivery::Pending,
        };
        let created_at: String = row.get(12)?;
        let dedup_key: String = row.get(13)?;

        Ok(AlertRecord {
            id: Uuid::parse_str(&id_str).unwrap_or_default(),
            dedup_key: DedupKey::parse(&dedup_key).unwrap_or(DedupKey {
                entity_id: entity_id.clone(),
                rounded_bucket: bucket_start,
            }),
            entity_id,
            source: row.get(2)?,
            bucket_start,
            score: row.get(4)?,
            z_score: row.get(5)?,
            count: row.get::<_, i64>(6)?.max(0) as u64,
            severity,
            state_transition: StateTransition {
                from: AlertState::parse(&from).unwrap_or_default(),
                to: AlertState::parse(&to).unwrap_or_default(),
            },
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_default(),
            delivery,
        })
    })?;

    let mut alerts = Vec::new();
    for r in rows {
        alerts.push(r?);
    }
    Ok(alerts)
}
