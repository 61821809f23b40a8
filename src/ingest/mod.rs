//! Input contract: normalized, entity-tagged content items.
//!
//! Connectors and entity extraction live outside the engine. They hand over a
//! restartable sequence of [`Item`]s; every call to [`ItemSource::items`]
//! starts the sequence again from the beginning.

use std::collections::BTreeSet;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One normalized content item. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub source: String,
    pub entity_ids: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
    /// Sample text supplied by the extractor, used by the safety gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Item {
    pub fn new<I, S>(source: &str, entity_ids: I, timestamp: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: source.to_string(),
            entity_ids: entity_ids.into_iter().map(Into::into).collect(),
            timestamp,
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

pub type ItemIter<'a> = Box<dyn Iterator<Item = Result<Item>> + Send + 'a>;

/// A lazy, restartable sequence of items.
pub trait ItemSource: Send + Sync {
    fn items(&self) -> Result<ItemIter<'_>>;
}

/// Items held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    items: Vec<Item>,
}

impl MemorySource {
    pub fn new(items: Vec<Item>) -> Self {
        Self { items }
    }
}

impl ItemSource for MemorySource {
    fn items(&self) -> Result<ItemIter<'_>> {
        Ok(Box::new(self.items.iter().cloned().map(Ok::<Item, anyhow::Error>)))
    }
}

/// Items stored one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlSource {
    path: PathBuf,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ItemSource for JsonlSource {
    fn items(&self) -> Result<ItemIter<'_>> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("failed to open items file: {}", self.path.display()))?;
        let path = self.path.clone();

        let iter = BufReader::new(file)
            .lines()
            .enumerate()
            .filter_map(move |(idx, line)| {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        return Some(Err(anyhow::Error::new(e)
                            .context(format!("failed to read {}", path.display()))))
                    }
                };
                if line.trim().is_empty() {
                    return None;
                }
                match serde_json::from_str::<Item>(&line) {
                    Ok(item) => Some(Ok(item)),
                    Err(e) => {
                        // Malformed lines are the extractor's problem, not the run's.
                        warn!(path = %path.display(), line = idx + 1, error = %e, "skipping malformed item");
                        None
                    }
                }
            });
        Ok(Box::new(iter))
    }
}
