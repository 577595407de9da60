use crate::window::WindowKind;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Handle;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown window kind {0:?}, expected \"fixed\" or \"sliding\"")]
    UnknownKind(String),
    #[error("max_limit {max} is below min_limit {min}")]
    BoundsInverted { min: f64, max: f64 },
    #[error("limit bounds must be positive, got min_limit {min} and max_limit {max}")]
    NonPositiveBound { min: f64, max: f64 },
    #[error("limit {limit} is outside [{min}, {max}]")]
    LimitOutOfBounds { limit: f64, min: f64, max: f64 },
    #[error("limit must be a positive number, got {0}")]
    InvalidLimit(f64),
    #[error("window must be a positive number of seconds, got {0}")]
    InvalidWindow(f64),
}

/// Settings for a [`WindowLimiter`](crate::WindowLimiter).
///
/// `limit` and `window` are the configured values; the limiter normalizes
/// fractional limits into an integral limit over an adjusted window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub limit: f64,
    pub kind: WindowKind,
    /// Window length in seconds.
    pub window: f64,
    pub min_limit: f64,
    pub max_limit: f64,
    pub burstable: bool,
    pub release_required: bool,
    /// Runtime the background scheduler is spawned on. Falls back to the
    /// runtime of whoever first has to queue.
    #[serde(skip)]
    pub parent: Option<Handle>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: 1.0,
            kind: WindowKind::Fixed,
            window: 1.0,
            min_limit: f64::MIN_POSITIVE,
            max_limit: f64::MAX,
            burstable: true,
            release_required: true,
            parent: None,
        }
    }
}

impl LimiterConfig {
    pub fn new(limit: f64) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: WindowKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window.as_secs_f64();
        self
    }

    pub fn with_bounds(mut self, min_limit: f64, max_limit: f64) -> Self {
        self.min_limit = min_limit;
        self.max_limit = max_limit;
        self
    }

    pub fn with_burstable(mut self, burstable: bool) -> Self {
        self.burstable = burstable;
        self
    }

    /// Without release, only the window bounds admissions and [`release`]
    /// never has to be called.
    ///
    /// [`release`]: crate::WindowLimiter::release
    pub fn with_release_required(mut self, release_required: bool) -> Self {
        self.release_required = release_required;
        self
    }

    pub fn with_parent(mut self, parent: Handle) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.window.is_finite() || self.window <= 0.0 {
            return Err(ConfigError::InvalidWindow(self.window));
        }
        check_bounds(self.min_limit, self.max_limit)?;
        check_limit(self.limit, self.min_limit, self.max_limit)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read limiter config {}", path.display()))?;
        let parsed = toml::from_str::<LimiterConfig>(&raw).context("parse limiter config")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = toml::to_string_pretty(self).context("serialize limiter config")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data.as_bytes()).context("write temp file")?;
        fs::rename(&tmp, path).context("rename temp file")?;
        Ok(())
    }
}

pub(crate) fn check_bounds(min: f64, max: f64) -> Result<(), ConfigError> {
    if !(min > 0.0 && max > 0.0) {
        return Err(ConfigError::NonPositiveBound { min, max });
    }
    if max < min {
        return Err(ConfigError::BoundsInverted { min, max });
    }
    Ok(())
}

pub(crate) fn check_limit(limit: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if limit.is_nan() || limit <= 0.0 {
        return Err(ConfigError::InvalidLimit(limit));
    }
    if limit < min || limit > max {
        return Err(ConfigError::LimitOutOfBounds { limit, min, max });
    }
    Ok(())
}
