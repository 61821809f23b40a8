//! Run coordinator: one refresh at a time, entity work fanned out across
//! blocking workers, state persisted at the end of every run.
//!
//! A run goes through four phases:
//!
//! 1. ingest the source into the aggregator and freeze due intervals,
//! 2. score every entity's queued buckets (parallel, per-entity ordered),
//! 3. rank and walk the ranking through the alert state machine,
//! 4. persist baselines, momentum, alert state and history.
//!
//! Phases 1-3 share one deadline. Ingestion reads into a copy of the
//! aggregator that replaces the live one only once the whole source has been
//! read. Workers check the deadline between entities, so an entity's buckets
//! are either all applied or all left queued for the next run. Scores that
//! were not walked through the state machine before the run stopped are
//! carried over and evaluated first by the next run. Phase 4 always runs,
//! including after a timeout or ordering error.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{AggregatorState, BucketAggregator, ClosedInterval, EntityBucket};
use crate::alert::{self, AlertRecord, AlertStateMachine, Delivery, Notifier, SafetyGate};
use crate::baseline::{BaselineError, BaselineStore};
use crate::config::{Config, EngineConfig, RunConfig};
use crate::ingest::ItemSource;
use crate::scheduler::history::{self, RunStatus};
use crate::storage::{self, Pool};
use crate::trend::{self, history as trend_history, BucketScore, TrendScore, TrendScorer, TrendSummary};

const AGGREGATOR_STATE_KEY: &str = "aggregator";
const BACKLOG_STATE_KEY: &str = "backlog";
const DEFERRED_STATE_KEY: &str = "deferred_alerts";

const INGEST_READING: u8 = 0;
const INGEST_COMMITTED: u8 = 1;
const INGEST_ABANDONED: u8 = 2;

/// Phase a run was in when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Ingest,
    Score,
    Alert,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunPhase::Ingest => "ingest",
            RunPhase::Score => "score",
            RunPhase::Alert => "alert",
        })
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("RunLockConflict: another refresh is already running")]
    RunLockConflict,

    #[error(transparent)]
    BaselineOrdering(#[from] BaselineError),

    #[error("run exceeded its {limit:?} timeout during {phase}")]
    Timeout { limit: Duration, phase: RunPhase },

    #[error("item source failed: {0:#}")]
    Source(anyhow::Error),

    #[error("storage failed: {0:#}")]
    Storage(anyhow::Error),

    #[error("worker failed: {0}")]
    Worker(String),
}

impl RunError {
    fn status(&self) -> RunStatus {
        match self {
            RunError::RunLockConflict => RunStatus::Conflict,
            RunError::Timeout { .. } => RunStatus::Aborted,
            _ => RunStatus::Failed,
        }
    }

    /// False when the run stopped before the source's items reached the
    /// aggregator, so the same items can be offered again without being
    /// counted twice.
    pub fn items_committed(&self) -> bool {
        !matches!(
            self,
            RunError::RunLockConflict
                | RunError::Source(_)
                | RunError::Timeout {
                    phase: RunPhase::Ingest,
                    ..
                }
        )
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Schedule,
    Manual,
    Api,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Schedule => "schedule",
            RunTrigger::Manual => "manual",
            RunTrigger::Api => "api",
        }
    }
}

/// Outcome of one refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub id: Uuid,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub items_seen: u64,
    pub late_discarded: u64,
    pub buckets_closed: usize,
    pub entities_scored: usize,
    pub insufficient_data: usize,
    pub alerts_delivered: usize,
    pub alerts_suppressed: usize,
    pub alerts_failed: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Ranking produced by this run; empty when no bucket closed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranking: Vec<TrendScore>,
}

impl RunReport {
    fn started(trigger: RunTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            status: RunStatus::Running,
            items_seen: 0,
            late_discarded: 0,
            buckets_closed: 0,
            entities_scored: 0,
            insufficient_data: 0,
            alerts_delivered: 0,
            alerts_suppressed: 0,
            alerts_failed: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            ranking: Vec::new(),
        }
    }

    fn count_alert(&mut self, record: &AlertRecord) {
        match record.delivery {
            Delivery::Delivered => self.alerts_delivered += 1,
            Delivery::Failed(_) => self.alerts_failed += 1,
            Delivery::SuppressedSafety(_) | Delivery::SuppressedDuplicate => {
                self.alerts_suppressed += 1
            }
            Delivery::Pending => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Run lock
// ---------------------------------------------------------------------------

/// Non-blocking exclusive lock: a second acquirer is refused, not queued.
#[derive(Debug, Default)]
pub struct RunLock {
    running: AtomicBool,
}

impl RunLock {
    pub fn try_acquire(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { lock: self })
    }

    pub fn is_held(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct RunGuard<'a> {
    lock: &'a RunLock,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.lock.running.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A frozen bucket waiting to be scored for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBucket {
    pub bucket_start: DateTime<Utc>,
    pub bucket: EntityBucket,
}

type Backlog = BTreeMap<String, Vec<PendingBucket>>;

/// A scored bucket still owed a pass through the alert state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredAlert {
    pub score: TrendScore,
    pub bucket: EntityBucket,
}

/// What the ingest worker hands back once its items are committed.
#[derive(Debug)]
struct IngestOutput {
    items_seen: u64,
    late: u64,
    closed: Vec<ClosedInterval>,
}

/// Per-entity result of the scoring phase.
#[derive(Debug)]
struct EntityOutcome {
    entity: String,
    /// Buckets taken off the entity's queue, including a rejected one.
    consumed: usize,
    latest: Option<(TrendScore, EntityBucket)>,
    insufficient: bool,
    error: Option<BaselineError>,
}

/// Shared cancellation flag plus deadline.
#[derive(Debug, Clone)]
struct RunControl {
    cancelled: Arc<AtomicBool>,
    deadline: Instant,
}

impl RunControl {
    fn should_stop(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || Instant::now() >= self.deadline
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// The trend detection and alerting engine.
pub struct Engine {
    config: EngineConfig,
    run: RunConfig,
    aggregator: Arc<Mutex<BucketAggregator>>,
    backlog: Mutex<Backlog>,
    baselines: Arc<BaselineStore>,
    scorer: Arc<TrendScorer>,
    alerts: AlertStateMachine,
    gate: Arc<SafetyGate>,
    notifier: Arc<dyn Notifier>,
    pool: Option<Pool>,
    lock: RunLock,
    latest: RwLock<Vec<TrendScore>>,
    deferred: Mutex<Vec<DeferredAlert>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("run", &self.run)
            .field("baselines", &self.baselines.len())
            .field("persistent", &self.pool.is_some())
            .finish()
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        run: RunConfig,
        gate: SafetyGate,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            aggregator: Arc::new(Mutex::new(BucketAggregator::new(&config))),
            backlog: Mutex::new(BTreeMap::new()),
            baselines: Arc::new(BaselineStore::new(&config)),
            scorer: Arc::new(TrendScorer::new(&config)),
            alerts: AlertStateMachine::new(&config),
            gate: Arc::new(gate),
            notifier,
            pool: None,
            lock: RunLock::default(),
            latest: RwLock::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
            config,
            run,
        }
    }

    /// Build an engine from a full configuration, with the notifier it names.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let notifier = alert::notifier::from_config(&config.notifier)
            .context("failed to build notifier")?;
        let gate = SafetyGate::from_config(&config.engine, &config.safety)
            .context("failed to build safety classifiers")?;
        Ok(Self::new(
            config.engine.clone(),
            config.run.clone(),
            gate,
            Arc::from(notifier),
        ))
    }

    /// Attach a database and reload all persisted state from it.
    pub fn with_pool(mut self, pool: Pool) -> anyhow::Result<Self> {
        let baselines = self.baselines.load(&pool)?;
        let momentum = self.scorer.load(&pool)?;
        let alert_states = self.alerts.load(&pool)?;

        {
            let mut aggregator = self.aggregator.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(state) = storage::load_state::<AggregatorState>(&pool, AGGREGATOR_STATE_KEY)? {
                aggregator.restore(state);
            }
            // Never hand over a bucket a baseline has already absorbed.
            if let Some(newest) = self
                .baselines
                .snapshot()
                .iter()
                .filter_map(|(_, stat)| stat.last_updated_bucket)
                .max()
            {
                aggregator.freeze_until(newest);
            }
        }
        if let Some(backlog) = storage::load_state::<Backlog>(&pool, BACKLOG_STATE_KEY)? {
            *self.backlog.lock().unwrap_or_else(PoisonError::into_inner) = backlog;
        }
        if let Some(deferred) = storage::load_state::<Vec<DeferredAlert>>(&pool, DEFERRED_STATE_KEY)? {
            *self.deferred.lock().unwrap_or_else(PoisonError::into_inner) = deferred;
        }

        let latest = trend_history::latest_ranking(&pool, u32::MAX as usize)?;
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = latest;

        info!(baselines, momentum, alert_states, "engine state loaded");
        self.pool = Some(pool);
        Ok(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn alerts(&self) -> &AlertStateMachine {
        &self.alerts
    }

    /// True while a refresh holds the run lock.
    pub fn is_running(&self) -> bool {
        self.lock.is_held()
    }

    /// Ranking of the newest run that scored anything.
    pub fn latest_ranking(&self) -> Vec<TrendScore> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Scores waiting for the alert state machine, oldest first.
    pub fn deferred_alerts(&self) -> Vec<DeferredAlert> {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn summary(&self) -> TrendSummary {
        TrendSummary::from_ranking(
            &self.latest_ranking(),
            self.config.soft_threshold,
            self.config.hard_threshold,
        )
    }

    /// Run one refresh over `source`, treating `now` as the current time.
    ///
    /// Fails fast with [`RunError::RunLockConflict`] while another refresh is
    /// in flight.
    pub async fn start_run(
        &self,
        source: Arc<dyn ItemSource>,
        now: DateTime<Utc>,
        trigger: RunTrigger,
    ) -> Result<RunReport, RunError> {
        let Some(_guard) = self.lock.try_acquire() else {
            warn!(trigger = trigger.as_str(), "RunLockConflict: refresh already in progress");
            let mut report = RunReport::started(trigger);
            report.status = RunStatus::Conflict;
            report.error = Some(RunError::RunLockConflict.to_string());
            report.finished_at = Some(Utc::now());
            self.record_run(&report);
            return Err(RunError::RunLockConflict);
        };

        let mut report = RunReport::started(trigger);
        let control = RunControl {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now() + self.run.timeout(),
        };
        info!(run = %report.id, trigger = trigger.as_str(), now = %now, "refresh started");

        let mut outcome = self.execute(source, now, &control, &mut report).await;
        if outcome.is_ok() {
            if let Err(e) = self.persist(&report) {
                outcome = Err(RunError::Storage(e));
            }
        } else if let Err(e) = self.persist(&report) {
            error!(run = %report.id, error = %format!("{:#}", e), "failed to persist aborted run");
        }

        report.finished_at = Some(Utc::now());
        match &outcome {
            Ok(()) => {
                report.status = RunStatus::Success;
                info!(
                    run = %report.id,
                    items = report.items_seen,
                    late = report.late_discarded,
                    buckets = report.buckets_closed,
                    scored = report.entities_scored,
                    insufficient = report.insufficient_data,
                    delivered = report.alerts_delivered,
                    suppressed = report.alerts_suppressed,
                    failed = report.alerts_failed,
                    "refresh finished"
                );
            }
            Err(e) => {
                report.status = e.status();
                report.error = Some(e.to_string());
                match e {
                    RunError::BaselineOrdering(_) => error!(run = %report.id, error = %e, "refresh aborted"),
                    _ => warn!(run = %report.id, error = %e, "refresh aborted"),
                }
            }
        }
        self.record_run(&report);

        outcome.map(|()| report)
    }

    async fn execute(
        &self,
        source: Arc<dyn ItemSource>,
        now: DateTime<Utc>,
        control: &RunControl,
        report: &mut RunReport,
    ) -> Result<(), RunError> {
        let closed = self.ingest(source, now, control, report).await?;
        report.buckets_closed = closed.len();
        self.enqueue(closed);

        let outcomes = self.score(control).await?;
        let mut ranked = Vec::new();
        let mut ordering_error = None;
        for outcome in outcomes {
            if outcome.insufficient {
                report.insufficient_data += 1;
            }
            if let Some(latest) = outcome.latest {
                ranked.push(latest);
            }
            if ordering_error.is_none() {
                ordering_error = outcome.error;
            }
        }
        if let Some(e) = ordering_error {
            self.defer(ranked);
            return Err(RunError::BaselineOrdering(e));
        }
        if self.pending_entities() > 0 && control.should_stop() {
            self.defer(ranked);
            return Err(self.timeout(RunPhase::Score));
        }

        report.entities_scored = ranked.len();
        let buckets: BTreeMap<String, EntityBucket> = ranked
            .iter()
            .map(|(score, bucket)| (score.entity_id.clone(), bucket.clone()))
            .collect();
        let ranking = trend::rank(ranked.into_iter().map(|(score, _)| score).collect());
        if !ranking.is_empty() {
            *self.latest.write().unwrap_or_else(PoisonError::into_inner) = ranking.clone();
        }
        report.ranking = ranking.clone();

        self.alert(&ranking, &buckets, control, report).await
    }

    /// Phase 1: feed the source through the aggregator and freeze what is due.
    ///
    /// Items are counted into a copy of the aggregator. The copy replaces the
    /// live aggregator only after the last item was read, so a run stopped
    /// mid-source leaves no trace of the items it did read.
    async fn ingest(
        &self,
        source: Arc<dyn ItemSource>,
        now: DateTime<Utc>,
        control: &RunControl,
        report: &mut RunReport,
    ) -> Result<Vec<ClosedInterval>, RunError> {
        let aggregator = Arc::clone(&self.aggregator);
        let gate = Arc::clone(&self.gate);
        let commit = Arc::new(AtomicU8::new(INGEST_READING));
        let worker_commit = Arc::clone(&commit);
        let mut handle = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<IngestOutput>> {
            let mut scratch = aggregator
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let late_before = scratch.late_discarded();
            let mut items_seen = 0u64;
            for item in source.items()? {
                if worker_commit.load(Ordering::Acquire) == INGEST_ABANDONED {
                    return Ok(None);
                }
                scratch.ingest_screened(&item?, &gate);
                items_seen += 1;
            }
            if worker_commit
                .compare_exchange(INGEST_READING, INGEST_COMMITTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(None);
            }
            let closed = scratch.close_due(now);
            let late = scratch.late_discarded() - late_before;
            *aggregator.lock().unwrap_or_else(PoisonError::into_inner) = scratch;
            Ok(Some(IngestOutput {
                items_seen,
                late,
                closed,
            }))
        });

        let deadline = tokio::time::Instant::from_std(control.deadline);
        let joined = match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                if commit
                    .compare_exchange(INGEST_READING, INGEST_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    control.cancel();
                    return Err(self.timeout(RunPhase::Ingest));
                }
                // Committed right at the deadline: its intervals are frozen
                // now and must still be queued.
                handle.await
            }
        };
        let output = joined
            .map_err(|e| RunError::Source(anyhow::anyhow!("ingest worker failed: {}", e)))?
            .map_err(RunError::Source)?
            .ok_or_else(|| self.timeout(RunPhase::Ingest))?;
        report.items_seen = output.items_seen;
        report.late_discarded = output.late;
        Ok(output.closed)
    }

    /// Queue closed intervals per entity. Entities already known but absent
    /// from an interval are queued with a zero count.
    fn enqueue(&self, closed: Vec<ClosedInterval>) {
        if closed.is_empty() {
            return;
        }
        let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
        let mut known: BTreeSet<String> = self.baselines.entities().into_iter().collect();
        known.extend(backlog.keys().cloned());

        for interval in closed {
            known.extend(interval.entities.keys().cloned());
            for entity in &known {
                let bucket = interval.entities.get(entity).cloned().unwrap_or_default();
                backlog.entry(entity.clone()).or_default().push(PendingBucket {
                    bucket_start: interval.bucket_start,
                    bucket,
                });
            }
        }
        debug!(entities = backlog.len(), "buckets queued for scoring");
    }

    fn pending_entities(&self) -> usize {
        self.backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Phase 2: score queued buckets, entities spread across workers.
    async fn score(&self, control: &RunControl) -> Result<Vec<EntityOutcome>, RunError> {
        let jobs: Vec<(String, Vec<PendingBucket>)> = self
            .backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(entity, buckets)| (entity.clone(), buckets.clone()))
            .collect();
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.run.workers.max(1);
        let chunk_size = jobs.len().div_ceil(workers);
        let mut handles = Vec::with_capacity(workers);
        let mut jobs = jobs.into_iter().peekable();
        while jobs.peek().is_some() {
            let chunk: Vec<_> = jobs.by_ref().take(chunk_size).collect();
            let baselines = Arc::clone(&self.baselines);
            let scorer = Arc::clone(&self.scorer);
            let control = control.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let mut outcomes = Vec::with_capacity(chunk.len());
                for (entity, buckets) in chunk {
                    if control.should_stop() {
                        break;
                    }
                    let outcome = score_entity(&baselines, &scorer, entity, &buckets);
                    if outcome.error.is_some() {
                        control.cancel();
                    }
                    outcomes.push(outcome);
                }
                outcomes
            }));
        }

        let mut outcomes = Vec::new();
        let mut join_error = None;
        for handle in handles {
            match handle.await {
                Ok(chunk) => outcomes.extend(chunk),
                Err(e) => join_error = Some(RunError::Worker(e.to_string())),
            }
        }

        {
            let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
            for outcome in &outcomes {
                if let Some(queue) = backlog.get_mut(&outcome.entity) {
                    queue.drain(..outcome.consumed.min(queue.len()));
                    if queue.is_empty() {
                        backlog.remove(&outcome.entity);
                    }
                }
            }
        }

        match join_error {
            Some(e) => {
                self.defer(outcomes.into_iter().filter_map(|o| o.latest).collect());
                Err(e)
            }
            None => Ok(outcomes),
        }
    }

    /// Phase 3: walk the ranking through the state machine and hand alerts off.
    ///
    /// Scores carried over from an earlier run go first, unless this run
    /// scored a newer bucket of the same entity. Whatever is left unwalked
    /// when the deadline hits is carried over again.
    async fn alert(
        &self,
        ranking: &[TrendScore],
        buckets: &BTreeMap<String, EntityBucket>,
        control: &RunControl,
        report: &mut RunReport,
    ) -> Result<(), RunError> {
        let mut queue: Vec<DeferredAlert> =
            std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner))
                .into_iter()
                .filter(|d| !buckets.contains_key(&d.score.entity_id))
                .collect();
        if !queue.is_empty() {
            info!(count = queue.len(), "evaluating alerts carried over from an earlier run");
        }
        queue.extend(ranking.iter().map(|score| DeferredAlert {
            score: score.clone(),
            bucket: buckets.get(&score.entity_id).cloned().unwrap_or_default(),
        }));

        let deadline = tokio::time::Instant::from_std(control.deadline);
        for (i, pending) in queue.iter().enumerate() {
            if control.should_stop() {
                self.defer(queue[i..].to_vec());
                return Err(self.timeout(RunPhase::Alert));
            }
            let source = pending.bucket.dominant_source().unwrap_or("unknown");
            let Some(candidate) = self.alerts.evaluate(&pending.score, source) else {
                continue;
            };

            let dispatched = tokio::time::timeout_at(
                deadline,
                alert::dispatch(
                    &self.alerts,
                    &self.gate,
                    self.notifier.as_ref(),
                    candidate,
                    Some(&pending.bucket),
                ),
            )
            .await;
            let record = match dispatched {
                Ok(record) => record,
                Err(_) => {
                    control.cancel();
                    // The interrupted entity stays ALERTING and re-emits.
                    self.defer(queue[i..].to_vec());
                    return Err(self.timeout(RunPhase::Alert));
                }
            };

            report.count_alert(&record);
            if let Some(pool) = &self.pool {
                if let Err(e) = alert::record_alert(pool, &record) {
                    warn!(entity = %record.entity_id, error = %format!("{:#}", e), "failed to log alert");
                }
            }
        }
        Ok(())
    }

    /// Carry scores over to the next run. A newer score for an entity
    /// replaces the one already waiting.
    fn defer(&self, alerts: Vec<impl Into<DeferredAlert>>) {
        if alerts.is_empty() {
            return;
        }
        let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        for alert in alerts {
            let alert = alert.into();
            deferred.retain(|d| d.score.entity_id != alert.score.entity_id);
            deferred.push(alert);
        }
        warn!(pending = deferred.len(), "alert evaluation carried over to the next run");
    }

    fn timeout(&self, phase: RunPhase) -> RunError {
        RunError::Timeout {
            limit: self.run.timeout(),
            phase,
        }
    }

    /// Phase 4: write everything back. A no-op without a database.
    fn persist(&self, report: &RunReport) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        self.baselines.persist(pool)?;
        self.scorer.persist(pool)?;
        self.alerts.persist(pool)?;

        let aggregator = self
            .aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state();
        storage::save_state(pool, AGGREGATOR_STATE_KEY, &aggregator)?;
        let backlog = self
            .backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        storage::save_state(pool, BACKLOG_STATE_KEY, &backlog)?;
        let deferred = self.deferred_alerts();
        storage::save_state(pool, DEFERRED_STATE_KEY, &deferred)?;

        if !report.ranking.is_empty() {
            trend_history::save_ranking(pool, report.id, &report.ranking)?;
        }
        Ok(())
    }

    fn record_run(&self, report: &RunReport) {
        if let Some(pool) = &self.pool {
            if let Err(e) = history::record_run(pool, report) {
                warn!(run = %report.id, error = %format!("{:#}", e), "failed to record run history");
            }
        }
    }
}

impl From<(TrendScore, EntityBucket)> for DeferredAlert {
    fn from((score, bucket): (TrendScore, EntityBucket)) -> Self {
        Self { score, bucket }
    }
}

/// Apply an entity's queued buckets in order. Stops at the first rejected
/// bucket, which is consumed so it cannot wedge later runs.
fn score_entity(
    baselines: &BaselineStore,
    scorer: &TrendScorer,
    entity: String,
    buckets: &[PendingBucket],
) -> EntityOutcome {
    let mut outcome = EntityOutcome {
        entity,
        consumed: 0,
        latest: None,
        insufficient: false,
        error: None,
    };
    for pending in buckets {
        outcome.consumed += 1;
        match scorer.score_bucket(
            baselines,
            &outcome.entity,
            pending.bucket_start,
            pending.bucket.total,
        ) {
            Ok(BucketScore::Scored(score)) => {
                outcome.insufficient = false;
                outcome.latest = Some((score, pending.bucket.clone()));
            }
            Ok(BucketScore::InsufficientData { .. }) => {
                outcome.insufficient = true;
                outcome.latest = None;
            }
            Err(e) => {
                error!(entity = %outcome.entity, error = %e, "BaselineOrderingViolation");
                outcome.error = Some(e);
                break;
            }
        }
    }
    outcome
}
