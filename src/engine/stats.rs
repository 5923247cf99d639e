// Live statistics aggregation — cache hits and misses, network traffic, bytes served.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

struct StatsSample {
    at: Instant,
    served_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub passthrough: u64,
    pub network_fetches: u64,
    pub network_failures: u64,
    pub stored_bytes: u64,
    pub served_bytes: u64,
    pub serve_bps: u64,
    pub inflight_fetches: u32,
    pub cache_entries: usize,
    pub cache_hit_rate: f64,
}

pub struct StatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    passthrough: AtomicU64,
    network_fetches: AtomicU64,
    network_failures: AtomicU64,
    stored_bytes: AtomicU64,
    served_bytes: AtomicU64,
    inflight_fetches: AtomicU32,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            passthrough: AtomicU64::new(0),
            network_fetches: AtomicU64::new(0),
            network_failures: AtomicU64::new(0),
            stored_bytes: AtomicU64::new(0),
            served_bytes: AtomicU64::new(0),
            inflight_fetches: AtomicU32::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                served_bytes: 0,
            }),
        }
    }

    pub fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.served_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A request that bypassed the cache entirely.
    pub fn record_passthrough(&self) {
        self.passthrough.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_served(&self, bytes: u64) {
        self.served_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_stored(&self, bytes: u64) {
        self.stored_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_network_failure(&self) {
        self.network_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a network fetch as started. Pair with `fetch_finished`.
    pub fn fetch_started(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
        self.inflight_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_finished(&self) {
        self.inflight_fetches.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache_entries: usize) -> StatsSnapshot {
        let now = Instant::now();
        let current_served = self.served_bytes.load(Ordering::Relaxed);

        let serve_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();

            let bps = if elapsed > 0.1 {
                ((current_served - sample.served_bytes) as f64 / elapsed) as u64
            } else {
                0
            };

            // Update sample for next call
            sample.at = now;
            sample.served_bytes = current_served;
            bps
        };

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let cache_hit_rate = if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        };

        StatsSnapshot {
            hits,
            misses,
            passthrough: self.passthrough.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
            stored_bytes: self.stored_bytes.load(Ordering::Relaxed),
            served_bytes: current_served,
            serve_bps,
            inflight_fetches: self.inflight_fetches.load(Ordering::Relaxed),
            cache_entries,
            cache_hit_rate,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
