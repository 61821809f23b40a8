//! Bucket aggregation: items -> per-entity, per-source, per-interval counts.
//!
//! Intervals are fixed-width and aligned to the Unix epoch. An interval stays
//! mutable until `grace_window` further intervals have elapsed past its end;
//! it is then frozen and handed to the scorer exactly once. Items for an
//! interval that has already been handed over are discarded and counted as
//! late.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::alert::{SafetyGate, SafetyVerdict};
use crate::config::EngineConfig;
use crate::ingest::Item;

/// Sample texts kept per entity and interval for display.
pub const MAX_SAMPLES_PER_BUCKET: usize = 3;

/// What happened to one ingested item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The item was counted once for each of its entities.
    Counted { entities: usize },
    /// The item's interval was already frozen.
    LateItemDiscarded { bucket_start: DateTime<Utc> },
    /// The item carried no entity ids.
    NoEntities,
}

/// Counts of one entity within one interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityBucket {
    pub total: u64,
    pub by_source: BTreeMap<String, u64>,
    pub samples: Vec<String>,
    /// Safety verdict of the first item text the gate flagged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flagged: Option<String>,
}

impl EntityBucket {
    /// Source with the highest count; ties go to the lexicographically first.
    pub fn dominant_source(&self) -> Option<&str> {
        self.by_source
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(source, _)| source.as_str())
    }
}

/// A frozen interval, ready for scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedInterval {
    pub bucket_start: DateTime<Utc>,
    pub entities: BTreeMap<String, EntityBucket>,
}

/// Serializable view of the aggregator, kept across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatorState {
    pub width_secs: i64,
    /// Open intervals keyed by start, in Unix seconds.
    pub open: BTreeMap<i64, BTreeMap<String, EntityBucket>>,
    pub frozen_through: Option<i64>,
}

/// Turns a stream of items into bucketed counts.
#[derive(Debug, Clone)]
pub struct BucketAggregator {
    width_secs: i64,
    grace_window: i64,
    /// Intervals that received at least one item and are not frozen yet.
    open: BTreeMap<i64, BTreeMap<String, EntityBucket>>,
    /// Start of the newest interval handed over so far.
    frozen_through: Option<i64>,
    late_discarded: u64,
}

impl BucketAggregator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            width_secs: config.bucket_width_secs as i64,
            grace_window: config.grace_window as i64,
            open: BTreeMap::new(),
            frozen_through: None,
            late_discarded: 0,
        }
    }

    /// Start of the interval containing `ts`.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        to_datetime(self.align(ts.timestamp()))
    }

    fn align(&self, secs: i64) -> i64 {
        secs.div_euclid(self.width_secs) * self.width_secs
    }

    /// Count one item. Duplicate items are counted twice; dedup is upstream.
    pub fn ingest(&mut self, item: &Item) -> IngestOutcome {
        self.ingest_with(item, None)
    }

    /// Like [`Self::ingest`], and screen the item's text through `gate`. A
    /// flagged text marks the bucket of every entity the item names.
    pub fn ingest_screened(&mut self, item: &Item, gate: &SafetyGate) -> IngestOutcome {
        self.ingest_with(item, Some(gate))
    }

    fn ingest_with(&mut self, item: &Item, gate: Option<&SafetyGate>) -> IngestOutcome {
        let entities: Vec<&String> = item
            .entity_ids
            .iter()
            .filter(|e| !e.trim().is_empty())
            .collect();
        if entities.is_empty() {
            return IngestOutcome::NoEntities;
        }

        let start = self.align(item.timestamp.timestamp());
        if self.frozen_through.is_some_and(|frozen| start <= frozen) {
            self.late_discarded += 1;
            let bucket_start = to_datetime(start);
            debug!(
                source = %item.source,
                timestamp = %item.timestamp,
                bucket = %bucket_start,
                "LateItemDiscarded: interval already frozen"
            );
            return IngestOutcome::LateItemDiscarded { bucket_start };
        }

        let text = item.text.as_deref().filter(|t| !t.trim().is_empty());
        let flag = match (text, gate) {
            (Some(text), Some(gate)) => match gate.screen(text) {
                SafetyVerdict::Violation(reason) => {
                    debug!(source = %item.source, %reason, "item text flagged");
                    Some(reason)
                }
                SafetyVerdict::Pass => None,
            },
            _ => None,
        };
        let interval = self.open.entry(start).or_default();
        for entity in &entities {
            let bucket = interval.entry((*entity).clone()).or_default();
            bucket.total += 1;
            *bucket.by_source.entry(item.source.clone()).or_insert(0) += 1;
            if let Some(text) = text {
                if bucket.samples.len() < MAX_SAMPLES_PER_BUCKET {
                    bucket.samples.push(text.to_string());
                }
            }
            if bucket.flagged.is_none() {
                bucket.flagged = flag.clone();
            }
        }

        IngestOutcome::Counted {
            entities: entities.len(),
        }
    }

    /// Freeze every interval whose grace period has elapsed at `now`, oldest
    /// first. Intervals that never received an item are not returned: those
    /// are ingestion gaps, not quiet periods.
    pub fn close_due(&mut self, now: DateTime<Utc>) -> Vec<ClosedInterval> {
        let mutable_from = self.align(now.timestamp()) - self.grace_window * self.width_secs;

        let due: Vec<i64> = self
            .open
            .range(..mutable_from)
            .map(|(start, _)| *start)
            .collect();

        let mut closed = Vec::with_capacity(due.len());
        for start in due {
            if let Some(entities) = self.open.remove(&start) {
                closed.push(ClosedInterval {
                    bucket_start: to_datetime(start),
                    entities,
                });
            }
        }

        // Everything before the mutable range is frozen now, gap or not.
        self.freeze_through(mutable_from - self.width_secs);

        if !closed.is_empty() {
            debug!(intervals = closed.len(), now = %now, "froze intervals");
        }
        closed
    }

    fn freeze_through(&mut self, boundary: i64) {
        if self.frozen_through.map_or(true, |frozen| boundary > frozen) {
            self.frozen_through = Some(boundary);
        }
        // Anything at or below the boundary can no longer be handed over.
        self.open = self.open.split_off(&(boundary + 1));
    }

    /// Treat every interval up to and including `bucket_start` as frozen.
    /// Used after a restart so buckets already folded into baselines are
    /// never handed over twice.
    pub fn freeze_until(&mut self, bucket_start: DateTime<Utc>) {
        let boundary = self.align(bucket_start.timestamp());
        if self.frozen_through.map_or(true, |frozen| boundary > frozen) {
            self.freeze_through(boundary);
        }
    }

    /// Start of the newest frozen interval.
    pub fn frozen_through(&self) -> Option<DateTime<Utc>> {
        self.frozen_through.map(to_datetime)
    }

    pub fn state(&self) -> AggregatorState {
        AggregatorState {
            width_secs: self.width_secs,
            open: self.open.clone(),
            frozen_through: self.frozen_through,
        }
    }

    /// Restore a saved state. A state saved under a different bucket width
    /// cannot be mapped onto the current intervals and is dropped.
    pub fn restore(&mut self, state: AggregatorState) -> bool {
        if state.width_secs != self.width_secs {
            warn!(
                saved = state.width_secs,
                configured = self.width_secs,
                "bucket width changed; discarding saved open intervals"
            );
            return false;
        }
        self.open = state.open;
        self.frozen_through = state.frozen_through;
        true
    }

    /// Number of items discarded as late since construction.
    pub fn late_discarded(&self) -> u64 {
        self.late_discarded
    }

    /// Number of intervals still accepting items.
    pub fn open_intervals(&self) -> usize {
        self.open.len()
    }
}

pub(crate) fn to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
}
