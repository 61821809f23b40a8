use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Engine, RunError, RunReport, RunTrigger};
use crate::ingest::{ItemSource, JsonlSource, MemorySource};
use crate::scheduler::Scheduler;

/// Main scheduler execution loop. Sleeps until the next cron fire time and
/// triggers one refresh per tick. Never returns.
pub async fn run_scheduler_loop(scheduler: Scheduler, engine: Arc<Engine>, items_path: Option<PathBuf>) {
    info!(cron = scheduler.expr(), "Scheduler engine started");

    loop {
        let now = Utc::now();
        let Some(next) = scheduler.next_after(now) else {
            warn!(cron = scheduler.expr(), "schedule has no future fire times; scheduler stopped");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        debug!(next = %next, "waiting for next refresh");
        tokio::time::sleep(wait).await;

        match run_scheduled(&engine, items_path.as_deref(), RunTrigger::Schedule).await {
            Ok(report) => {
                info!(run = %report.id, scored = report.entities_scored, "scheduled refresh complete")
            }
            Err(RunError::RunLockConflict) => {
                warn!("previous refresh still running, tick skipped");
            }
            Err(e) => error!("scheduled refresh failed: {}", e),
        }
    }
}

/// Run one refresh over the configured drop file.
///
/// `items_path` is a drop file: producers append JSON lines to it, and each
/// tick claims it by renaming it to `<name>.processing`. The claimed file is
/// removed once the engine has committed its items. It is kept for the next
/// tick when the run stopped before that: a lock conflict, a read error, or
/// a timeout while ingesting.
pub async fn run_scheduled(
    engine: &Engine,
    items_path: Option<&Path>,
    trigger: RunTrigger,
) -> Result<RunReport, RunError> {
    let claimed = match items_path {
        Some(path) => claim(path).map_err(RunError::Source)?,
        None => None,
    };
    let source: Arc<dyn ItemSource> = match &claimed {
        Some(path) => Arc::new(JsonlSource::new(path.clone())),
        None => Arc::new(MemorySource::default()),
    };

    run_claimed(engine, source, claimed.as_deref(), trigger).await
}

/// Run over `source`, read from the claimed file `claimed`, and remove that
/// file only if the run got its items into the aggregator.
async fn run_claimed(
    engine: &Engine,
    source: Arc<dyn ItemSource>,
    claimed: Option<&Path>,
    trigger: RunTrigger,
) -> Result<RunReport, RunError> {
    let result = engine.start_run(source, Utc::now(), trigger).await;
    let Some(path) = claimed else {
        return result;
    };
    match &result {
        Err(e) if !e.items_committed() => {
            info!(path = %path.display(), error = %e, "items file kept for the next tick");
        }
        _ => {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove processed items file");
            }
        }
    }
    result
}

/// Claim the drop file. A `.processing` file left by an earlier tick is
/// picked up first.
fn claim(path: &Path) -> anyhow::Result<Option<PathBuf>> {
    let mut name = path.as_os_str().to_os_string();
    name.push(".processing");
    let processing = PathBuf::from(name);

    if processing.exists() {
        return Ok(Some(processing));
    }
    if !path.exists() {
        return Ok(None);
    }
    std::fs::rename(path, &processing)?;
    Ok(Some(processing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{MemoryNotifier, SafetyGate};
    use crate::config::{EngineConfig, RunConfig};
    use crate::coordinator::RunPhase;
    use crate::ingest::{Item, ItemIter};

    fn engine() -> Engine {
        Engine::new(
            EngineConfig::default(),
            RunConfig::default(),
            SafetyGate::new(&[]),
            Arc::new(MemoryNotifier::new()),
        )
    }

    #[tokio::test]
    async fn test_scheduled_run_consumes_drop_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("items.jsonl");
        let ts = Utc::now().to_rfc3339();
        std::fs::write(
            &path,
            format!(
                "{{\"source\":\"reddit\",\"entity_ids\":[\"gizmo\"],\"timestamp\":\"{}\"}}\n",
                ts
            ),
        )
        .unwrap();

        let engine = engine();
        let report = run_scheduled(&engine, Some(&path), RunTrigger::Schedule)
            .await
            .unwrap();
        assert_eq!(report.items_seen, 1);
        assert!(!path.exists());
        assert!(!dir.path().join("items.jsonl.processing").exists());
    }

    /// Reads the claimed file, but slower than the run timeout allows.
    struct SlowFileSource {
        path: PathBuf,
    }

    impl ItemSource for SlowFileSource {
        fn items(&self) -> anyhow::Result<ItemIter<'_>> {
            let ts = Utc::now();
            let _ = std::fs::read_to_string(&self.path)?;
            Ok(Box::new((0..10).map(move |_| {
                std::thread::sleep(std::time::Duration::from_millis(300));
                Ok(Item::new("reddit", ["gizmo"], ts))
            })))
        }
    }

    #[tokio::test]
    async fn test_ingest_timeout_keeps_claimed_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("items.jsonl");
        std::fs::write(&path, "{}\n").unwrap();
        let claimed = claim(&path).unwrap().unwrap();

        let engine = Engine::new(
            EngineConfig::default(),
            RunConfig {
                timeout_secs: 1,
                workers: 1,
            },
            SafetyGate::new(&[]),
            Arc::new(MemoryNotifier::new()),
        );
        let source = Arc::new(SlowFileSource {
            path: claimed.clone(),
        });
        let result = run_claimed(&engine, source, Some(&claimed), RunTrigger::Schedule).await;
        assert!(matches!(
            result,
            Err(RunError::Timeout {
                phase: RunPhase::Ingest,
                ..
            })
        ));
        assert!(claimed.exists());

        // The next tick picks the leftover up again.
        assert_eq!(claim(&path).unwrap(), Some(claimed));
    }

    #[tokio::test]
    async fn test_scheduled_run_without_items() {
        let engine = engine();
        let report = run_scheduled(&engine, None, RunTrigger::Manual)
            .await
            .unwrap();
        assert_eq!(report.items_seen, 0);
        assert!(report.ranking.is_empty());
    }

    #[test]
    fn test_claim_prefers_leftover() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("items.jsonl");
        assert!(claim(&path).unwrap().is_none());

        std::fs::write(&path, "").unwrap();
        let leftover = dir.path().join("items.jsonl.processing");
        std::fs::write(&leftover, "").unwrap();
        assert_eq!(claim(&path).unwrap(), Some(leftover));
        assert!(path.exists());
    }
}
