//! TOML configuration for the trendwatch engine.
//!
//! The `[engine]` section enumerates every tunable of the trend and alert
//! pipeline and has no defaults: a file missing any of them fails to load.
//! Operational sections (`[run]`, `[storage]`, `[api]`, ...) fall back to
//! compiled-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A tunable that is missing or outside its allowed range.
#[derive(Debug, Error, PartialEq)]
#[error("invalid configuration value `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the trendwatch process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded trendwatch configuration");
        Ok(config)
    }

    /// Resolve the config file location, in order:
    /// 1. The explicit path (CLI flag).
    /// 2. The `TRENDWATCH_CONFIG` environment variable.
    /// 3. `/etc/trendwatch/trendwatch.toml`.
    ///
    /// Unlike the operational sections, the engine tunables have no
    /// compiled-in fallback, so a missing file is an error.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Ok(env_path) = std::env::var("TRENDWATCH_CONFIG") {
            debug!(path = %env_path, "using TRENDWATCH_CONFIG");
            return Ok(PathBuf::from(env_path));
        }
        let system_path = PathBuf::from("/etc/trendwatch/trendwatch.toml");
        if system_path.exists() {
            return Ok(system_path);
        }
        warn!("no configuration file found");
        anyhow::bail!("no configuration file: pass --config or set TRENDWATCH_CONFIG")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.run.validate()?;
        cron_schedule(&self.schedule.cron)?;
        if self.storage.history_days == 0 {
            return Err(ConfigError::new("storage.history_days", "must be at least 1"));
        }
        if self.notifier.timeout_secs == 0 {
            return Err(ConfigError::new("notifier.timeout_secs", "must be at least 1"));
        }
        Ok(())
    }
}

/// Parse a cron expression the way the scheduler will.
pub fn cron_schedule(expr: &str) -> Result<cron::Schedule, ConfigError> {
    use std::str::FromStr;
    cron::Schedule::from_str(expr)
        .map_err(|e| ConfigError::new("schedule.cron", format!("'{}': {}", expr, e)))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Relative weights of the three trend signals in the combined score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoreWeights {
    pub w_z: f64,
    pub w_g: f64,
    pub w_v: f64,
}

impl Default for ScoreWeights {
    /// Starting point only; favours statistical significance over raw growth.
    fn default() -> Self {
        Self {
            w_z: 1.0,
            w_g: 0.3,
            w_v: 0.2,
        }
    }
}

/// Longest span, in seconds, any bucket-derived period may cover (about a
/// century). Keeps timestamp arithmetic on bucket boundaries in range.
pub const MAX_SPAN_SECS: i64 = 100 * 366 * 86_400;

/// Every tunable of the aggregation, scoring and alerting pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Width of one aggregation bucket, in seconds.
    pub bucket_width_secs: u64,
    /// Number of closed intervals that still accept late items.
    pub grace_window: u32,
    /// Number of buckets that dominate the EWMA baseline.
    pub baseline_window_buckets: u32,
    /// Closed buckets required before an entity is scored.
    pub min_observations: u32,
    /// Floor applied to the baseline standard deviation (epsilon).
    pub variance_floor: f64,
    pub score_weights: ScoreWeights,
    pub soft_threshold: f64,
    pub hard_threshold: f64,
    /// Quiet period after an alert, in buckets.
    pub cooldown_buckets: u32,
    pub safety_blocklist: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket_width_secs: 3600,
            grace_window: 2,
            baseline_window_buckets: 24,
            min_observations: 3,
            variance_floor: 0.5,
            score_weights: ScoreWeights::default(),
            soft_threshold: 2.0,
            hard_threshold: 3.5,
            cooldown_buckets: 6,
            safety_blocklist: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_width_secs == 0 {
            return Err(ConfigError::new("engine.bucket_width_secs", "must be positive"));
        }
        if self.span(1).is_none() {
            return Err(ConfigError::new(
                "engine.bucket_width_secs",
                format!("must be at most {} seconds", MAX_SPAN_SECS),
            ));
        }
        if self.span(self.grace_window).is_none() {
            return Err(ConfigError::new(
                "engine.grace_window",
                format!("grace period must span at most {} seconds", MAX_SPAN_SECS),
            ));
        }
        if self.baseline_window_buckets == 0 {
            return Err(ConfigError::new(
                "engine.baseline_window_buckets",
                "must be at least 1",
            ));
        }
        if self.min_observations == 0 {
            return Err(ConfigError::new("engine.min_observations", "must be at least 1"));
        }
        if !self.variance_floor.is_finite() || self.variance_floor <= 0.0 {
            return Err(ConfigError::new(
                "engine.variance_floor",
                "must be a finite value greater than zero",
            ));
        }

        let w = &self.score_weights;
        for (field, value) in [
            ("engine.score_weights.w_z", w.w_z),
            ("engine.score_weights.w_g", w.w_g),
            ("engine.score_weights.w_v", w.w_v),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::new(field, "must be finite and non-negative"));
            }
        }
        if w.w_z + w.w_g + w.w_v == 0.0 {
            return Err(ConfigError::new(
                "engine.score_weights",
                "at least one weight must be positive",
            ));
        }

        if !self.soft_threshold.is_finite() || self.soft_threshold <= 0.0 {
            return Err(ConfigError::new(
                "engine.soft_threshold",
                "must be finite and positive",
            ));
        }
        if !self.hard_threshold.is_finite() || self.hard_threshold < self.soft_threshold {
            return Err(ConfigError::new(
                "engine.hard_threshold",
                format!("must be finite and >= soft_threshold ({})", self.soft_threshold),
            ));
        }
        if self.cooldown_buckets == 0 {
            return Err(ConfigError::new("engine.cooldown_buckets", "must be at least 1"));
        }
        if self.span(self.cooldown_buckets).is_none() {
            return Err(ConfigError::new(
                "engine.cooldown_buckets",
                format!("cooldown must span at most {} seconds", MAX_SPAN_SECS),
            ));
        }
        if self.safety_blocklist.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::new(
                "engine.safety_blocklist",
                "terms must not be empty",
            ));
        }
        Ok(())
    }

    /// EWMA decay factor for the configured window, `2 / (N + 1)`.
    pub fn ewma_alpha(&self) -> f64 {
        2.0 / (self.baseline_window_buckets as f64 + 1.0)
    }

    /// Quiet period after an alert: `cooldown_buckets` bucket widths.
    pub fn cooldown_span(&self) -> TimeDelta {
        self.span(self.cooldown_buckets)
            .unwrap_or(TimeDelta::seconds(MAX_SPAN_SECS))
    }

    /// `buckets` bucket widths, or `None` when that leaves the range the
    /// engine does date arithmetic in.
    fn span(&self, buckets: u32) -> Option<TimeDelta> {
        i64::try_from(self.bucket_width_secs)
            .ok()?
            .checked_mul(i64::from(buckets))
            .filter(|secs| *secs <= MAX_SPAN_SECS)
            .and_then(TimeDelta::try_seconds)
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Limits applied to one refresh run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Wall-clock limit for a whole refresh, in seconds.
    pub timeout_secs: u64,
    /// Worker tasks used to fan entity work out.
    pub workers: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            workers: 4,
        }
    }
}

impl RunConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::new("run.timeout_secs", "must be at least 1"));
        }
        if self.workers == 0 {
            return Err(ConfigError::new("run.workers", "must be at least 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// 6-field cron expression (seconds first) for periodic refreshes.
    pub cron: String,
    /// Optional JSON-lines file the scheduled runs read items from.
    pub items_path: Option<PathBuf>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 */15 * * * *".to_string(),
            items_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Days of trend and alert history kept for the dashboard.
    pub history_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/trendwatch.db"),
            history_days: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Webhook receiving alert records as JSON. Alerts are only logged when unset.
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Safety
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Score item texts on spam signals.
    pub spam_heuristic: bool,
    /// Flag texts dense with profanity or slurs.
    pub profanity: bool,
    /// Flag hate speech phrases and coded references.
    pub hate_speech: bool,
    /// Flag texts carrying several conspiracy or misinformation markers.
    pub misinformation: bool,
    /// Flag sexual content.
    pub nsfw: bool,
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
