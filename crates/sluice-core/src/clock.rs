use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time as seconds elapsed since the clock was created.
///
/// Backed by [`tokio::time::Instant`], so a paused test runtime drives it
/// the same way it drives `tokio::time::sleep`.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

// Timer wheels fire at or after the requested instant, but converting an
// `f64` deadline back into an `Instant` can land a few nanoseconds short.
const DEADLINE_SLACK: Duration = Duration::from_micros(1);

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// The instant at which `now()` will first be at least `secs`.
    pub fn instant_at(&self, secs: f64) -> Instant {
        if secs.is_nan() || secs <= 0.0 {
            return self.origin;
        }
        self.origin
            .checked_add(to_duration(secs))
            .and_then(|at| at.checked_add(DEADLINE_SLACK))
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE)
    }
}

// Roughly 30 years, the same horizon tokio uses for "never".
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Converts seconds into a `Duration`, saturating instead of panicking.
pub fn to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
