use crate::limiter::WindowLimiter;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Something that decides when a unit of work may start.
#[async_trait]
pub trait Admission: Send + Sync {
    async fn acquire(&self);
    fn release(&self);
    fn is_blocking(&self) -> bool;
    fn in_flight(&self) -> usize;
}

#[async_trait]
impl Admission for WindowLimiter {
    async fn acquire(&self) {
        WindowLimiter::acquire(self).await
    }

    fn release(&self) {
        WindowLimiter::release(self)
    }

    fn is_blocking(&self) -> bool {
        WindowLimiter::is_blocking(self)
    }

    fn in_flight(&self) -> usize {
        self.count()
    }
}

/// Admits everything immediately, only counting what is in flight.
#[derive(Debug, Default)]
pub struct Unlimited {
    count: AtomicUsize,
}

impl Unlimited {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Admission for Unlimited {
    async fn acquire(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        let res = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if res.is_err() {
            warn!("release called without a matching acquire");
        }
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn in_flight(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}
