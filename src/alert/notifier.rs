//! Alert delivery. Each notifier makes a single attempt per record.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{info, warn};

use super::AlertRecord;
use crate::config::NotifierConfig;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("notifier is not configured")]
    NotConfigured,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("receiver rejected alert with status {0}")]
    Rejected(u16),
}

/// Downstream consumer of alert records.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, record: &AlertRecord) -> Result<(), NotifierError>;
}

/// Build the notifier described by the configuration.
pub fn from_config(config: &NotifierConfig) -> Result<Box<dyn Notifier>, NotifierError> {
    match config.webhook_url.as_deref() {
        Some(url) => Ok(Box::new(WebhookNotifier::new(
            url,
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Box::new(LogNotifier)),
    }
}

/// Writes alerts to the log. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, record: &AlertRecord) -> Result<(), NotifierError> {
        info!(
            entity = %record.entity_id,
            source = %record.source,
            bucket = %record.bucket_start,
            score = record.score,
            severity = record.severity.as_str(),
            "trend alert"
        );
        Ok(())
    }
}

/// POSTs each alert as JSON. Any non-2xx response is a failure.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifierError> {
        if url.trim().is_empty() {
            return Err(NotifierError::NotConfigured);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, record: &AlertRecord) -> Result<(), NotifierError> {
        let response = self.client.post(&self.url).json(record).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, status = status.as_u16(), "webhook rejected alert");
            return Err(NotifierError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Keeps delivered records in memory; can be told to fail.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    delivered: Mutex<Vec<AlertRecord>>,
    fail_with: Option<u16>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier that rejects every record with `status`.
    pub fn failing(status: u16) -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            fail_with: Some(status),
        }
    }

    pub fn delivered(&self) -> Vec<AlertRecord> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Notifier for MemoryNotifier {
    async fn deliver(&self, record: &AlertRecord) -> Result<(), NotifierError> {
        if let Some(status) = self.fail_with {
            return Err(NotifierError::Rejected(status));
        }
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertState, DedupKey, Delivery, Severity, StateTransition};
    use chrono::Utc;
    use uuid::Uuid;

    fn record() -> AlertRecord {
        let now = Utc::now();
        AlertRecord {
            id: Uuid::new_v4(),
            entity_id: "gizmo".to_string(),
            source: "reddit".to_string(),
            bucket_start: now,
            score: 9.0,
            z_score: 9.0,
            count: 40,
            severity: Severity::Viral,
            state_transition: StateTransition {
                from: AlertState::Watch,
                to: AlertState::Alerting,
            },
            dedup_key: DedupKey {
                entity_id: "gizmo".to_string(),
                rounded_bucket: now,
            },
            created_at: now,
            delivery: Delivery::Pending,
        }
    }

    #[tokio::test]
    async fn test_memory_notifier_collects() {
        let notifier = MemoryNotifier::new();
        notifier.deliver(&record()).await.unwrap();
        assert_eq!(notifier.delivered().len(), 1);
        assert_eq!(notifier.delivered()[0].entity_id, "gizmo");
    }

    #[tokio::test]
    async fn test_failing_notifier_reports_status() {
        let notifier = MemoryNotifier::failing(503);
        let err = notifier.deliver(&record()).await.unwrap_err();
        assert!(matches!(err, NotifierError::Rejected(503)));
        assert!(notifier.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_log_notifier_always_delivers() {
        assert!(LogNotifier.deliver(&record()).await.is_ok());
    }

    #[test]
    fn test_from_config_picks_notifier() {
        assert!(from_config(&NotifierConfig::default()).is_ok());
        let empty = NotifierConfig {
            webhook_url: Some("  ".to_string()),
            timeout_secs: 5,
        };
        assert!(matches!(
            from_config(&empty),
            Err(NotifierError::NotConfigured)
        ));
    }
}
