//! In-memory counters and latency histograms for the poll engine.
//! The checker records, the HTTP API reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

pub struct CycleStats {
    cycles_run: AtomicU64,
    groups_checked: AtomicU64,
    groups_skipped: AtomicU64,
    cache_hits: AtomicU64,
    live_queries: AtomicU64,
    query_failures: AtomicU64,
    notifications_sent: AtomicU64,
    deliveries_failed: AtomicU64,
    /// Full cycle wall time, milliseconds.
    cycle_ms: Mutex<hdrhistogram::Histogram<u64>>,
    /// Single live query wall time, milliseconds.
    query_ms: Mutex<hdrhistogram::Histogram<u64>>,
}

impl CycleStats {
    /// Histograms track 1ms to 1h at 3 significant figures.
    pub fn new() -> Self {
        let hist = || {
            hdrhistogram::Histogram::new_with_bounds(1, 3_600_000, 3)
                .expect("valid histogram bounds")
        };
        Self {
            cycles_run: AtomicU64::new(0),
            groups_checked: AtomicU64::new(0),
            groups_skipped: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            live_queries: AtomicU64::new(0),
            query_failures: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            cycle_ms: Mutex::new(hist()),
            query_ms: Mutex::new(hist()),
        }
    }

    pub fn record_cycle(&self, duration: Duration) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut h) = self.cycle_ms.lock() {
            let _ = h.record((duration.as_millis().max(1)).min(u128::from(u64::MAX)) as u64);
        }
    }

    pub fn record_query(&self, duration: Duration) {
        self.live_queries.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut h) = self.query_ms.lock() {
            let _ = h.record((duration.as_millis().max(1)).min(u128::from(u64::MAX)) as u64);
        }
    }

    pub fn group_checked(&self) {
        self.groups_checked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn group_skipped(&self) {
        self.groups_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query_failed(&self) {
        self.query_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_failed(&self) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let percentiles = |m: &Mutex<hdrhistogram::Histogram<u64>>| {
            let Ok(h) = m.lock() else {
                return LatencyPercentiles::default();
            };
            if h.len() == 0 {
                return LatencyPercentiles::default();
            }
            LatencyPercentiles {
                p50_ms: Some(h.value_at_quantile(0.5)),
                p95_ms: Some(h.value_at_quantile(0.95)),
                p99_ms: Some(h.value_at_quantile(0.99)),
            }
        };

        StatsSnapshot {
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            groups_checked: self.groups_checked.load(Ordering::Relaxed),
            groups_skipped: self.groups_skipped.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            live_queries: self.live_queries.load(Ordering::Relaxed),
            query_failures: self.query_failures.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            cycle_latency: percentiles(&self.cycle_ms),
            query_latency: percentiles(&self.query_ms),
        }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct LatencyPercentiles {
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub cycles_run: u64,
    pub groups_checked: u64,
    pub groups_skipped: u64,
    pub cache_hits: u64,
    pub live_queries: u64,
    pub query_failures: u64,
    pub notifications_sent: u64,
    pub deliveries_failed: u64,
    pub cycle_latency: LatencyPercentiles,
    pub query_latency: LatencyPercentiles,
}
