//! Orchestrator configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment override for [`OrchestratorConfig::additional_timeout_ms`].
pub const ENV_ADDITIONAL_TIMEOUT_MS: &str = "KITCHENSINK_ADDITIONAL_TIMEOUT_MS";
/// Environment override for [`OrchestratorConfig::timeout_factor`].
pub const ENV_TIMEOUT_FACTOR: &str = "KITCHENSINK_TIMEOUT_FACTOR";
/// Environment override for [`OrchestratorConfig::concurrency`].
pub const ENV_CONCURRENCY: &str = "KITCHENSINK_CONCURRENCY";

/// Whether to run a coverage-capture pass before testing mutants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageMode {
    /// Every mutant runs the whole suite.
    Off,
    /// Each mutant runs only the tests that reach it.
    #[default]
    PerTest,
}

/// Configuration for an orchestration session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of test hosts running at once.
    pub concurrency: usize,
    /// Fixed margin added to every timeout, in milliseconds.
    pub additional_timeout_ms: u64,
    /// Multiplier applied to the baseline estimate.
    pub timeout_factor: f64,
    /// Absolute ceiling for discovery, baseline and coverage runs.
    pub initial_run_ceiling_ms: Option<u64>,
    /// How long to wait for a launched host to connect.
    pub connect_timeout_ms: u64,
    /// Launch attempts before giving up on a host.
    pub connect_attempts: u32,
    /// Failed rounds tolerated per mutant before it is marked as a runtime error.
    pub max_batch_retries: u32,
    /// Upper bound on mutants grouped into one batch.
    pub max_mutants_per_batch: usize,
    /// Coverage capture mode.
    pub coverage: CoverageMode,
    /// Append-only session journal.
    pub journal_path: Option<PathBuf>,
    /// Ignore statuses restored from the journal.
    pub retest_all: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            concurrency: (cores / 2).max(1),
            additional_timeout_ms: 50,
            timeout_factor: 1.5,
            initial_run_ceiling_ms: None,
            connect_timeout_ms: 5_000,
            connect_attempts: 3,
            max_batch_retries: 1,
            max_mutants_per_batch: 32,
            coverage: CoverageMode::PerTest,
            journal_path: None,
            retest_all: false,
        }
    }
}

impl OrchestratorConfig {
    /// Set host parallelism (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the fixed timeout margin.
    pub fn with_additional_timeout_ms(mut self, ms: u64) -> Self {
        self.additional_timeout_ms = ms;
        self
    }

    /// Set the timeout multiplier.
    pub fn with_timeout_factor(mut self, factor: f64) -> Self {
        self.timeout_factor = factor;
        self
    }

    /// Bound discovery, baseline and coverage runs.
    pub fn with_initial_run_ceiling_ms(mut self, ms: u64) -> Self {
        self.initial_run_ceiling_ms = Some(ms);
        self
    }

    /// Set the host connect timeout.
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set host launch attempts.
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    /// Set the per-mutant retry bound.
    pub fn with_max_batch_retries(mut self, retries: u32) -> Self {
        self.max_batch_retries = retries;
        self
    }

    /// Set the batch size bound (at least 1).
    pub fn with_max_mutants_per_batch(mut self, max: usize) -> Self {
        self.max_mutants_per_batch = max.max(1);
        self
    }

    /// Set coverage mode.
    pub fn with_coverage(mut self, coverage: CoverageMode) -> Self {
        self.coverage = coverage;
        self
    }

    /// Record the session in `path`.
    pub fn with_journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    /// Retest mutants that already have a recorded status.
    pub fn with_retest_all(mut self, retest_all: bool) -> Self {
        self.retest_all = retest_all;
        self
    }

    /// Apply `KITCHENSINK_*` environment overrides. Unparsable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = parse_override::<u64>(&lookup, ENV_ADDITIONAL_TIMEOUT_MS) {
            self.additional_timeout_ms = ms;
        }
        if let Some(factor) = parse_override::<f64>(&lookup, ENV_TIMEOUT_FACTOR) {
            self.timeout_factor = factor;
        }
        if let Some(concurrency) = parse_override::<usize>(&lookup, ENV_CONCURRENCY) {
            self.concurrency = concurrency.max(1);
        }
        self
    }

    /// Fixed timeout margin.
    pub fn additional_timeout(&self) -> Duration {
        Duration::from_millis(self.additional_timeout_ms)
    }

    /// Host connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Ceiling for discovery, baseline and coverage runs.
    pub fn initial_run_ceiling(&self) -> Option<Duration> {
        self.initial_run_ceiling_ms.map(Duration::from_millis)
    }
}

fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
