use crate::window::window_index;
use std::collections::VecDeque;

/// The most recent admissions, newest first, bounded by the effective limit.
///
/// Fixed-window limiters also keep the bucket index of every timestamp so
/// the blocking check does not have to recompute it.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionHistory {
    max: usize,
    times: VecDeque<f64>,
    window_indexes: Option<VecDeque<i64>>,
}

impl AcquisitionHistory {
    pub fn new(max: usize, track_indexes: bool) -> Self {
        Self {
            max,
            times: VecDeque::with_capacity(max.min(1024)),
            window_indexes: track_indexes.then(VecDeque::new),
        }
    }

    pub fn push(&mut self, t: f64, window: f64) {
        if self.max == 0 {
            return;
        }
        self.times.push_front(t);
        self.times.truncate(self.max);
        if let Some(indexes) = self.window_indexes.as_mut() {
            indexes.push_front(window_index(t, window));
            indexes.truncate(self.max);
        }
    }

    /// The `n`th most recent timestamp, zero based.
    pub fn time(&self, n: usize) -> Option<f64> {
        self.times.get(n).copied()
    }

    /// The bucket of the `n`th most recent admission, zero based.
    pub fn window_index(&self, n: usize) -> Option<i64> {
        self.window_indexes.as_ref()?.get(n).copied()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Changes the bound, dropping the oldest entries that no longer fit.
    pub fn resize(&mut self, max: usize) {
        self.max = max;
        self.times.truncate(max);
        if let Some(indexes) = self.window_indexes.as_mut() {
            indexes.truncate(max);
        }
    }

    /// Recomputes bucket indexes after the window length changed.
    pub fn reindex(&mut self, window: f64) {
        if let Some(indexes) = self.window_indexes.as_mut() {
            *indexes = self.times.iter().map(|t| window_index(*t, window)).collect();
        }
        debug_assert!(self
            .window_indexes
            .as_ref()
            .map_or(true, |indexes| indexes.len() == self.times.len()));
    }
}

/// Converts an effective limit into a history bound.
///
/// Zero for limits no history could ever fill; nothing is recorded then.
pub fn capacity_for(limit: f64) -> usize {
    if limit.is_finite() && limit < usize::MAX as f64 {
        limit.max(1.0) as usize
    } else {
        0
    }
}
