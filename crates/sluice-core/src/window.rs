use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How admissions are bucketed in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    #[default]
    Fixed,
    Sliding,
}

impl FromStr for WindowKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed" => Ok(WindowKind::Fixed),
            "sliding" => Ok(WindowKind::Sliding),
            _ => Err(ConfigError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowKind::Fixed => f.write_str("fixed"),
            WindowKind::Sliding => f.write_str("sliding"),
        }
    }
}

pub fn window_index(t: f64, window: f64) -> i64 {
    (t / window).floor() as i64
}

/// Rewrites a fractional `limit` into an integral one, scaling `window` so
/// that `limit / window` is unchanged.
///
/// Limits below one stretch the window to admit a single event. Larger
/// limits round down, unless the window is shorter than two units, where
/// rounding down could shrink it towards zero and the count rounds up
/// instead.
pub fn adjust_limit(limit: f64, window: f64) -> (f64, f64) {
    if limit.is_infinite() || limit.fract() == 0.0 {
        return (limit, window);
    }
    if limit < 1.0 {
        return (1.0, window / limit);
    }
    let rounded = if window >= 2.0 {
        limit.floor()
    } else {
        limit.ceil()
    };
    (rounded, window * rounded / limit)
}
