//! Immutable typed configuration snapshot (Options, C1).
//!
//! Layered the way the rest of the pack loads configuration: built-in
//! defaults, an optional TOML file, then `APP_<DOTTED_KEY_UPPER>`
//! environment overrides, validated once at startup into an immutable
//! [`EngineOptions`]. Nesting uses a double underscore so single-word
//! fields keep their own underscores intact, e.g. `APP_BATCH_SIZE`
//! overrides the flat `batch_size` key and `APP_LEDGER__POOL_SIZE`
//! overrides the nested `ledger.pool_size` key.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Ledger-specific concurrency knobs, nested under the `ledger.` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerOptions {
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub retry_attempts: u32,
    pub path: String,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            pool_size: 8,
            acquire_timeout_ms: 500,
            retry_attempts: 3,
            path: "./sentrymesh-ledger".to_string(),
        }
    }
}

/// Immutable configuration snapshot consumed by every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub num_agents: usize,
    pub steps: u64,
    pub parallel_enabled: bool,
    pub parallel_threshold: usize,
    pub max_workers: usize,
    pub batch_size: usize,
    pub anomaly_rate: f64,
    pub score_threshold: f64,
    pub validation_threshold: f64,
    pub min_confidence: f64,
    pub majority_ratio: f64,
    pub min_votes: Option<usize>,
    pub rolling_window: usize,
    pub seed: u64,
    pub step_deadline_ms: u64,
    pub ledger: LedgerOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            num_agents: 5,
            steps: 100,
            parallel_enabled: false,
            parallel_threshold: 16,
            max_workers: 8,
            batch_size: 32,
            anomaly_rate: 0.02,
            score_threshold: 0.6,
            validation_threshold: 0.7,
            min_confidence: 0.5,
            majority_ratio: 0.5,
            min_votes: None,
            rolling_window: 256,
            seed: 42,
            step_deadline_ms: 1000,
            ledger: LedgerOptions::default(),
        }
    }
}

impl EngineOptions {
    /// Load defaults, optionally merge a TOML file, then apply
    /// `APP_*` environment overrides. This never touches process-wide
    /// global state; the returned snapshot is passed explicitly to
    /// `Engine::new`. A double underscore (`__`) is the nesting
    /// separator so it doesn't collide with the single underscores
    /// already inside field names like `batch_size`.
    pub fn load(config_path: Option<&Path>) -> EngineResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineOptions::default())?);

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true),
        );

        let raw: EngineOptions = builder.build()?.try_deserialize()?;
        raw.validate()?;
        Ok(raw)
    }

    /// Validate invariants that the rest of the engine assumes hold.
    pub fn validate(&self) -> EngineResult<()> {
        if self.num_agents == 0 {
            return Err(EngineError::Config("num_agents must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.validation_threshold) {
            return Err(EngineError::Config(
                "validation_threshold must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.majority_ratio) {
            return Err(EngineError::Config("majority_ratio must be in [0, 1]".into()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch_size must be >= 1".into()));
        }
        if self.ledger.pool_size == 0 {
            return Err(EngineError::Config("ledger.pool_size must be >= 1".into()));
        }
        Ok(())
    }

    /// `min_votes` resolved against `num_agents`, per the default
    /// `max(1, floor(N * 0.1))` rule.
    pub fn resolved_min_votes(&self) -> usize {
        self.min_votes
            .unwrap_or_else(|| std::cmp::max(1, (self.num_agents as f64 * 0.1).floor() as usize))
    }

    pub fn step_deadline(&self) -> Duration {
        Duration::from_millis(self.step_deadline_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger.acquire_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineOptions::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_agents() {
        let mut opts = EngineOptions::default();
        opts.num_agents = 0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn resolved_min_votes_defaults_to_ten_percent() {
        let mut opts = EngineOptions::default();
        opts.num_agents = 50;
        opts.min_votes = None;
        assert_eq!(opts.resolved_min_votes(), 5);

        opts.num_agents = 3;
        assert_eq!(opts.resolved_min_votes(), 1);
    }

    #[test]
    fn explicit_min_votes_overrides_default() {
        let mut opts = EngineOptions::default();
        opts.min_votes = Some(7);
        assert_eq!(opts.resolved_min_votes(), 7);
    }
}
