use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of items a stage may hold before upstream is paused
pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

/// Default number of concurrent invocations inside a transform stage
pub const DEFAULT_MAX_PARALLEL: usize = 16;

/// Default idle window after which an unheld execution starts on its own
pub const DEFAULT_AUTO_START_AFTER_MS: u64 = 1000;

/// Pipeline-wide defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Buffer bound used by stages that don't set one
    pub default_high_water_mark: usize,
    /// Concurrency bound used by stages that don't set one
    pub default_max_parallel: usize,
    /// Whether an execution that is never started or awaited starts by itself
    pub auto_start: bool,
    /// Idle window before auto-start kicks in
    pub auto_start_after_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_high_water_mark: DEFAULT_HIGH_WATER_MARK,
            default_max_parallel: DEFAULT_MAX_PARALLEL,
            auto_start: true,
            auto_start_after_ms: DEFAULT_AUTO_START_AFTER_MS,
        }
    }
}

impl PipelineConfig {
    /// Parse a config from TOML text; missing keys fall back to defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Disable auto-start so executions only run when started or awaited
    pub fn manual_start(mut self) -> Self {
        self.auto_start = false;
        self
    }

    /// Set the auto-start idle window
    pub fn with_auto_start_after(mut self, window: Duration) -> Self {
        self.auto_start = true;
        self.auto_start_after_ms = window.as_millis() as u64;
        self
    }

    pub fn auto_start_after(&self) -> Option<Duration> {
        self.auto_start
            .then(|| Duration::from_millis(self.auto_start_after_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_high_water_mark == 0 {
            return Err(PipelineError::Config(
                "default_high_water_mark must be at least 1".into(),
            ));
        }
        if self.default_max_parallel == 0 {
            return Err(PipelineError::Config(
                "default_max_parallel must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-stage concurrency and buffering knobs.
///
/// `max_parallel` bounds the invocations in flight; `high_water_mark` bounds the items
/// accepted but not yet emitted, and sizes the stage's input buffer. When only one is
/// set the other follows it. A bare number sets both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOptions {
    #[serde(alias = "maxParallel")]
    pub max_parallel: Option<usize>,
    #[serde(alias = "highWaterMark")]
    pub high_water_mark: Option<usize>,
}

impl StageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = Some(n);
        self
    }

    pub fn high_water_mark(mut self, n: usize) -> Self {
        self.high_water_mark = Some(n);
        self
    }

    /// Resolve against pipeline defaults
    pub fn resolve(&self, config: &PipelineConfig) -> Result<Limits> {
        let high_water_mark = self
            .high_water_mark
            .or(self.max_parallel)
            .unwrap_or(config.default_high_water_mark);
        let max_parallel = self
            .max_parallel
            .or(self.high_water_mark)
            .unwrap_or(config.default_max_parallel);

        if high_water_mark == 0 || max_parallel == 0 {
            return Err(PipelineError::Config(format!(
                "stage limits must be at least 1 (max_parallel={max_parallel}, high_water_mark={high_water_mark})"
            )));
        }
        Ok(Limits {
            max_parallel,
            high_water_mark,
        })
    }
}

impl From<usize> for StageOptions {
    fn from(n: usize) -> Self {
        Self {
            max_parallel: Some(n),
            high_water_mark: Some(n),
        }
    }
}

/// Resolved limits of a live stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_parallel: usize,
    pub high_water_mark: usize,
}
