//! Batch configuration surface.
//!
//! `BatchConfig` is the read-only snapshot every part of the engine works
//! from: pyramid parameters, zoom range, declared bounds, retry settings,
//! overwrite behavior and the concurrency backend selection. It is built
//! once (usually by an external config-loading layer or the CLI), validated,
//! and then shared via `Arc` for the batch's lifetime.

use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::executor::RetryPolicy;
use crate::grid::{Bounds, TilePyramid, MAX_ZOOM};
use crate::raster::ResamplingMethod;

/// Environment variable overriding the retry attempt count.
pub const ENV_RETRY_TRIES: &str = "TILECASCADE_RETRY_TRIES";

/// Environment variable overriding the initial retry delay (milliseconds).
pub const ENV_RETRY_DELAY_MS: &str = "TILECASCADE_RETRY_DELAY_MS";

/// Environment variable overriding the retry backoff multiplier.
pub const ENV_RETRY_BACKOFF: &str = "TILECASCADE_RETRY_BACKOFF";

/// Errors raised while assembling a batch configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid zoom range: {min}..={max} (max supported: {limit})", limit = MAX_ZOOM)]
    InvalidZoomRange { min: u8, max: u8 },

    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("retry tries must be at least 1")]
    NoRetryTries,

    #[error("{0}")]
    Invalid(String),
}

/// Whether existing output blocks re-processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessMode {
    /// Skip tiles whose output already exists (incremental re-runs).
    Continue,
    /// Recompute and overwrite everything.
    Overwrite,
}

impl Default for ProcessMode {
    fn default() -> Self {
        Self::Continue
    }
}

/// Concurrency backend selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Concurrency {
    /// Run tasks one by one on the scheduler thread.
    Sequential,
    /// Bounded worker pool.
    WorkerPool { workers: usize },
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::WorkerPool {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// Retry configuration for transient I/O failures.
///
/// Values can be overridden through environment-style settings
/// ([`ENV_RETRY_TRIES`], [`ENV_RETRY_DELAY_MS`], [`ENV_RETRY_BACKOFF`]).
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySettings {
    /// Total attempt count, including the first try.
    pub tries: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            tries: 3,
            delay: Duration::from_millis(100),
            backoff: 2.0,
        }
    }
}

impl RetrySettings {
    /// Applies overrides from a key lookup (typically the environment).
    ///
    /// Unparseable values are ignored and the existing setting kept.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(tries) = lookup(ENV_RETRY_TRIES).and_then(|v| v.parse().ok()) {
            self.tries = tries;
        }
        if let Some(ms) = lookup(ENV_RETRY_DELAY_MS).and_then(|v| v.parse().ok()) {
            self.delay = Duration::from_millis(ms);
        }
        if let Some(backoff) = lookup(ENV_RETRY_BACKOFF).and_then(|v| v.parse().ok()) {
            self.backoff = backoff;
        }
        self
    }

    /// Applies overrides from the process environment.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Converts the settings into an executor retry policy.
    pub fn to_policy(&self) -> RetryPolicy {
        if self.tries <= 1 {
            RetryPolicy::None
        } else if self.backoff <= 1.0 {
            RetryPolicy::fixed(self.tries, self.delay)
        } else {
            RetryPolicy::ExponentialBackoff {
                max_attempts: self.tries,
                initial_delay: self.delay,
                max_delay: Duration::from_secs(
                    crate::executor::policy::DEFAULT_MAX_DELAY_SECS,
                ),
                multiplier: self.backoff,
            }
        }
    }
}

/// Inclusive zoom range for a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoomLevels {
    min: u8,
    max: u8,
}

impl ZoomLevels {
    pub fn new(min: u8, max: u8) -> Result<Self, ConfigError> {
        if min > max || max > MAX_ZOOM {
            return Err(ConfigError::InvalidZoomRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// A single zoom level.
    pub fn single(zoom: u8) -> Result<Self, ConfigError> {
        Self::new(zoom, zoom)
    }

    pub fn min(&self) -> u8 {
        self.min
    }

    pub fn max(&self) -> u8 {
        self.max
    }

    pub fn contains(&self, zoom: u8) -> bool {
        zoom >= self.min && zoom <= self.max
    }

    /// Zoom levels from highest detail to coarsest, the order the batch
    /// walks them.
    pub fn descending(&self) -> impl Iterator<Item = u8> {
        (self.min..=self.max).rev()
    }

    pub fn len(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Overview generation settings.
///
/// When present, only the maximum configured zoom (the baselevel) is
/// computed from inputs; every coarser zoom is aggregated from the zoom
/// below it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OverviewOptions {
    /// Resampling used when condensing children into a parent.
    pub resampling: ResamplingMethod,
}

impl Default for OverviewOptions {
    fn default() -> Self {
        Self {
            resampling: ResamplingMethod::Average,
        }
    }
}

/// Read-only configuration snapshot for one batch invocation.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub pyramid: TilePyramid,
    pub zoom_levels: ZoomLevels,
    pub bounds: Option<Bounds>,
    pub mode: ProcessMode,
    pub concurrency: Concurrency,
    pub retry: RetrySettings,
    pub overviews: Option<OverviewOptions>,
    /// Allow a batch whose resolved process area is empty to complete as a
    /// no-op instead of failing.
    pub allow_empty_area: bool,
    /// Free-form parameters handed to the user computation.
    pub process_parameters: Map<String, Value>,
}

impl BatchConfig {
    pub fn builder(pyramid: TilePyramid, zoom_levels: ZoomLevels) -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: BatchConfig {
                pyramid,
                zoom_levels,
                bounds: None,
                mode: ProcessMode::default(),
                concurrency: Concurrency::default(),
                retry: RetrySettings::default(),
                overviews: None,
                allow_empty_area: false,
                process_parameters: Map::new(),
            },
        }
    }

    /// Retry policy derived from the retry settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }

    /// The zoom level computed directly from inputs when overviews are
    /// enabled.
    pub fn baselevel(&self) -> u8 {
        self.zoom_levels.max()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Concurrency::WorkerPool { workers } = self.concurrency {
            if workers == 0 {
                return Err(ConfigError::NoWorkers);
            }
        }
        if self.retry.tries == 0 {
            return Err(ConfigError::NoRetryTries);
        }
        Ok(())
    }
}

/// Builder for [`BatchConfig`].
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn bounds(mut self, bounds: Bounds) -> Self {
        self.config.bounds = Some(bounds);
        self
    }

    pub fn mode(mut self, mode: ProcessMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn overwrite(self, overwrite: bool) -> Self {
        self.mode(if overwrite {
            ProcessMode::Overwrite
        } else {
            ProcessMode::Continue
        })
    }

    pub fn sequential(mut self) -> Self {
        self.config.concurrency = Concurrency::Sequential;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.concurrency = Concurrency::WorkerPool { workers };
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn overviews(mut self, options: OverviewOptions) -> Self {
        self.config.overviews = Some(options);
        self
    }

    pub fn allow_empty_area(mut self, allow: bool) -> Self {
        self.config.allow_empty_area = allow;
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.process_parameters.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<BatchConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
