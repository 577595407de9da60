use crate::clock::{to_duration, Clock};
use crate::config::{check_limit, ConfigError, LimiterConfig};
use crate::history::{capacity_for, AcquisitionHistory};
use crate::window::{adjust_limit, window_index, WindowKind};
use std::collections::VecDeque;
use std::future::Future;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Admits at most `limit` operations per window, queueing callers that
/// would exceed it.
///
/// Three conditions can block an [`acquire`](Self::acquire):
///
/// - the in-flight count has reached the limit (only when release is
///   required);
/// - the current window already holds `limit` admissions (burstable
///   limiters);
/// - the previous admission was less than `window / limit` ago
///   (non-burstable limiters).
///
/// Waiters are served strictly in arrival order.
#[derive(Debug, Clone)]
pub struct WindowLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    clock: Clock,
    parent: Option<Handle>,
    reschedule: Notify,

    #[cfg(test)]
    live_schedulers: AtomicUsize,
    #[cfg(test)]
    peak_schedulers: AtomicUsize,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct State {
    kind: WindowKind,
    burstable: bool,
    release_required: bool,
    min_limit: f64,
    max_limit: f64,
    configured_window: f64,
    // Effective values, always integral (or infinite) after normalization.
    limit: f64,
    window: f64,
    count: usize,
    history: AcquisitionHistory,
    last_acquired: Option<f64>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    scheduler_active: bool,
}

/// A point-in-time snapshot of a [`WindowLimiter`].
#[derive(Debug, Clone, Copy)]
pub struct LimiterState {
    limit: f64,
    window: Duration,
    in_flight: usize,
    waiting: usize,
    blocking: bool,
    scheduler_active: bool,
}

/// An admission that is released when dropped.
#[derive(Debug)]
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    limiter: WindowLimiter,
}

impl State {
    fn from_config(config: &LimiterConfig) -> Self {
        let (limit, window) = adjust_limit(config.limit, config.window);
        Self {
            kind: config.kind,
            burstable: config.burstable,
            release_required: config.release_required,
            min_limit: config.min_limit,
            max_limit: config.max_limit,
            configured_window: config.window,
            limit,
            window,
            count: 0,
            history: AcquisitionHistory::new(
                capacity_for(limit),
                config.kind == WindowKind::Fixed,
            ),
            last_acquired: None,
            waiters: VecDeque::new(),
            next_waiter_id: 0,
            scheduler_active: false,
        }
    }

    fn oldest_slot(&self) -> Option<usize> {
        capacity_for(self.limit).checked_sub(1)
    }

    fn limit_blocking(&self) -> bool {
        self.release_required && self.count as f64 >= self.limit
    }

    fn window_blocking(&self, now: f64) -> bool {
        if !self.burstable {
            return false;
        }
        let Some(slot) = self.oldest_slot() else {
            return false;
        };
        match self.kind {
            WindowKind::Fixed => {
                self.history.window_index(slot) == Some(window_index(now, self.window))
            }
            WindowKind::Sliding => self.history.time(slot).is_some_and(|t| t + self.window > now),
        }
    }

    fn frame_blocking(&self, now: f64) -> bool {
        if self.burstable {
            return false;
        }
        self.last_acquired.is_some_and(|t| t + self.frame() > now)
    }

    fn frame(&self) -> f64 {
        self.window / self.limit
    }

    fn is_blocking(&self, now: f64) -> bool {
        self.limit_blocking() || self.window_blocking(now) || self.frame_blocking(now)
    }

    fn admit(&mut self, now: f64) {
        self.count += 1;
        self.history.push(now, self.window);
        self.last_acquired = Some(now);
    }

    fn next_acquire_time(&self, now: f64) -> f64 {
        if !self.window_blocking(now) && !self.frame_blocking(now) {
            return now;
        }
        if self.burstable {
            match self.kind {
                WindowKind::Fixed => (window_index(now, self.window) + 1) as f64 * self.window,
                WindowKind::Sliding => self
                    .oldest_slot()
                    .and_then(|slot| self.history.time(slot))
                    .map_or(now, |t| t + self.window),
            }
        } else {
            self.last_acquired.map_or(now, |t| t + self.frame())
        }
    }

    fn resume_waiting(&mut self, now: f64) -> usize {
        let mut resumed = 0;
        while !self.is_blocking(now) {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // The receiver outlives its queue entry, so this only fails if
            // the waiter was torn down without deregistering.
            if waiter.tx.send(()).is_ok() {
                self.admit(now);
                resumed += 1;
            }
        }
        resumed
    }

    fn apply_limit(&mut self, limit: f64) {
        let (effective, window) = adjust_limit(limit, self.configured_window);
        self.limit = effective;
        self.window = window;
        self.history.resize(capacity_for(effective));
        self.history.reindex(window);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_scheduler(self: &Arc<Self>, state: &mut State) {
        if state.scheduler_active || state.waiters.is_empty() || state.limit_blocking() {
            return;
        }
        let Some(handle) = self.parent.clone().or_else(|| Handle::try_current().ok()) else {
            warn!(
                waiting = state.waiters.len(),
                "no tokio runtime available, window scheduler not started"
            );
            return;
        };
        state.scheduler_active = true;
        handle.spawn(run_scheduler(Arc::clone(self)));
    }

    fn release_locked(self: &Arc<Self>, state: &mut State) {
        if state.count == 0 {
            warn!("release called without a matching acquire");
        } else {
            state.count -= 1;
        }
        if state.release_required {
            let resumed = state.resume_waiting(self.clock.now());
            if resumed > 0 {
                debug!(resumed, in_flight = state.count, "waiters resumed on release");
            }
        }
        self.ensure_scheduler(state);
    }
}

async fn run_scheduler(inner: Arc<Inner>) {
    debug!("window scheduler started");
    #[cfg(test)]
    {
        let live = inner.live_schedulers.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_schedulers.fetch_max(live, Ordering::SeqCst);
    }
    loop {
        let deadline = {
            let mut state = inner.lock();
            let now = inner.clock.now();
            if state.waiters.is_empty() || state.limit_blocking() {
                state.scheduler_active = false;
                #[cfg(test)]
                inner.live_schedulers.fetch_sub(1, Ordering::SeqCst);
                debug!(waiting = state.waiters.len(), "window scheduler stopped");
                return;
            }
            if !state.is_blocking(now) {
                let resumed = state.resume_waiting(now);
                debug!(resumed, waiting = state.waiters.len(), "scheduler resumed waiters");
                continue;
            }
            state.next_acquire_time(now)
        };
        tokio::select! {
            _ = tokio::time::sleep_until(inner.clock.instant_at(deadline)) => {}
            _ = inner.reschedule.notified() => {}
        }
    }
}

// Dropping it before the grant arrives removes it from the queue.
struct Queued<'a> {
    inner: &'a Arc<Inner>,
    id: u64,
    rx: oneshot::Receiver<()>,
    admitted: bool,
}

impl Queued<'_> {
    async fn wait(mut self) {
        match (&mut self.rx).await {
            Ok(()) => self.admitted = true,
            Err(_) => unreachable!("waiter {} left the queue without a grant", self.id),
        }
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let mut state = self.inner.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
            debug!(waiter = self.id, "acquire cancelled while queued");
            return;
        }
        // Granted under the lock but never observed: give the slot back.
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            debug!(waiter = self.id, "acquire cancelled after admission, releasing");
            self.inner.release_locked(&mut state);
        }
    }
}

impl WindowLimiter {
    pub fn new(config: LimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = State::from_config(&config);
        debug!(
            kind = %state.kind,
            limit = state.limit,
            window = state.window,
            burstable = state.burstable,
            release_required = state.release_required,
            "window limiter created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                clock: Clock::new(),
                parent: config.parent,
                reschedule: Notify::new(),

                #[cfg(test)]
                live_schedulers: AtomicUsize::new(0),
                #[cfg(test)]
                peak_schedulers: AtomicUsize::new(0),
            }),
        })
    }

    pub fn fixed(limit: f64, window: Duration) -> Result<Self, ConfigError> {
        Self::new(LimiterConfig::new(limit).with_window(window))
    }

    pub fn sliding(limit: f64, window: Duration) -> Result<Self, ConfigError> {
        Self::new(
            LimiterConfig::new(limit)
                .with_kind(WindowKind::Sliding)
                .with_window(window),
        )
    }

    /// `limit` admissions per `window`, evenly spaced with no bursts.
    pub fn continuous(limit: f64, window: Duration) -> Result<Self, ConfigError> {
        Self::new(
            LimiterConfig::new(limit)
                .with_window(window)
                .with_burstable(false),
        )
    }

    /// Waits until the limiter admits the caller, then records the admission.
    ///
    /// Callers that arrive while others are queued wait their turn even if
    /// the limiter would admit them right away. Dropping the returned future
    /// before it completes withdraws the caller without admitting it.
    pub async fn acquire(&self) {
        let queued = {
            let mut state = self.inner.lock();
            let now = self.inner.clock.now();
            if state.waiters.is_empty() && !state.is_blocking(now) {
                state.admit(now);
                return;
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            debug!(waiter = id, waiting = state.waiters.len(), "acquire queued");
            self.inner.ensure_scheduler(&mut state);
            Queued {
                inner: &self.inner,
                id,
                rx,
                admitted: false,
            }
        };
        queued.wait().await;
    }

    pub fn release(&self) {
        let mut state = self.inner.lock();
        self.inner.release_locked(&mut state);
    }

    pub async fn permit(&self) -> Permit {
        self.acquire().await;
        Permit {
            limiter: self.clone(),
        }
    }

    /// Runs `work` on a new task once admitted, releasing afterwards.
    ///
    /// The slot is returned however the task ends, including when `work`
    /// panics or the task is aborted.
    pub fn spawn<F>(&self, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let limiter = self.clone();
        let task = async move {
            let _permit = limiter.permit().await;
            work.await
        };
        match &self.inner.parent {
            Some(handle) => handle.spawn(task),
            None => tokio::spawn(task),
        }
    }

    pub fn is_blocking(&self) -> bool {
        let state = self.inner.lock();
        state.is_blocking(self.inner.clock.now())
    }

    pub fn limit(&self) -> f64 {
        self.inner.lock().limit
    }

    /// Clamps `limit` into the configured bounds, normalizes it against the
    /// configured window and publishes it. Returns the effective limit.
    pub fn set_limit(&self, limit: f64) -> Result<f64, ConfigError> {
        if limit.is_nan() {
            return Err(ConfigError::InvalidLimit(limit));
        }
        let mut state = self.inner.lock();
        let clamped = limit.clamp(state.min_limit, state.max_limit);
        check_limit(clamped, state.min_limit, state.max_limit)?;
        state.apply_limit(clamped);
        info!(
            requested = limit,
            limit = state.limit,
            window = state.window,
            "window limit updated"
        );

        let resumed = state.resume_waiting(self.inner.clock.now());
        if resumed > 0 {
            debug!(resumed, "waiters resumed after limit change");
        }
        self.inner.ensure_scheduler(&mut state);
        self.inner.reschedule.notify_one();
        Ok(state.limit)
    }

    /// The effective window, saturating at `Duration::MAX`.
    pub fn window(&self) -> Duration {
        to_duration(self.inner.lock().window)
    }

    pub fn kind(&self) -> WindowKind {
        self.inner.lock().kind
    }

    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn state(&self) -> LimiterState {
        let state = self.inner.lock();
        LimiterState {
            limit: state.limit,
            window: to_duration(state.window),
            in_flight: state.count,
            waiting: state.waiters.len(),
            blocking: state.is_blocking(self.inner.clock.now()),
            scheduler_active: state.scheduler_active,
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

impl LimiterState {
    pub fn limit(&self) -> f64 {
        self.limit
    }
    pub fn window(&self) -> Duration {
        self.window
    }
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
    pub fn waiting(&self) -> usize {
        self.waiting
    }
    pub fn blocking(&self) -> bool {
        self.blocking
    }
    pub fn scheduler_active(&self) -> bool {
        self.scheduler_active
    }
}
