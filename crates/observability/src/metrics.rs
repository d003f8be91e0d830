//! In-process dispatcher counters.
//!
//! Plain atomics, shared through an `Arc` by every worker. A snapshot is
//! exposed by the admin surface next to the store-derived outbox stats.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    events_claimed: AtomicU64,
    events_done: AtomicU64,
    events_failed: AtomicU64,
    events_deferred: AtomicU64,
    delivery_attempts: AtomicU64,
    delivery_succeeded: AtomicU64,
    delivery_retried: AtomicU64,
    delivery_dead: AtomicU64,
    http_in_flight: AtomicI64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_claimed: u64,
    pub events_done: u64,
    pub events_failed: u64,
    pub events_deferred: u64,
    pub delivery_attempts: u64,
    pub delivery_succeeded: u64,
    pub delivery_retried: u64,
    pub delivery_dead: u64,
    pub http_in_flight: i64,
}

impl DispatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_claimed(&self, n: u64) {
        self.events_claimed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn event_done(&self) {
        self.events_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_deferred(&self) {
        self.events_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempt_started(&self) {
        self.delivery_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_succeeded(&self) {
        self.delivery_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_retried(&self) {
        self.delivery_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_dead(&self) {
        self.delivery_dead.fetch_add(1, Ordering::Relaxed);
    }

    /// Track one outbound request. The returned guard decrements on drop, so
    /// cancelled requests are accounted for too.
    pub fn http_request(&self) -> HttpInFlightGuard<'_> {
        self.http_in_flight.fetch_add(1, Ordering::Relaxed);
        HttpInFlightGuard { metrics: self }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_claimed: self.events_claimed.load(Ordering::Relaxed),
            events_done: self.events_done.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_deferred: self.events_deferred.load(Ordering::Relaxed),
            delivery_attempts: self.delivery_attempts.load(Ordering::Relaxed),
            delivery_succeeded: self.delivery_succeeded.load(Ordering::Relaxed),
            delivery_retried: self.delivery_retried.load(Ordering::Relaxed),
            delivery_dead: self.delivery_dead.load(Ordering::Relaxed),
            http_in_flight: self.http_in_flight.load(Ordering::Relaxed),
        }
    }
}

pub struct HttpInFlightGuard<'a> {
    metrics: &'a DispatcherMetrics,
}

impl Drop for HttpInFlightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.http_in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_guard_balances() {
        let m = DispatcherMetrics::new();
        {
            let _a = m.http_request();
            let _b = m.http_request();
            assert_eq!(m.snapshot().http_in_flight, 2);
        }
        assert_eq!(m.snapshot().http_in_flight, 0);
    }

    #[test]
    fn counters_accumulate() {
        let m = DispatcherMetrics::new();
        m.events_claimed(3);
        m.event_done();
        m.delivery_dead();
        let s = m.snapshot();
        assert_eq!((s.events_claimed, s.events_done, s.delivery_dead), (3, 1, 1));
    }
}
