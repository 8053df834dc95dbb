//! Decode and cache telemetry.
//!
//! The loader and the decode pool report through [`TelemetrySink`]; reporting is fire-and-forget
//! and must never influence cache or decode decisions. [`StatsCollector`] is the bundled sink and
//! keeps rolling sample windows that can be snapshotted for diagnostics.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

const DEFAULT_SAMPLE_CAPACITY: usize = 240;

/// Receiver for decode and cache measurements. Called from decode workers as well as the main
/// thread.
pub trait TelemetrySink: Send + Sync + Debug {
    fn record_decode(&self, duration: Duration);
    fn record_decode_chunks(&self, chunks: u32, bytes: u64);
    fn record_cache_lookup(&self, hit: bool);
    fn update_cache_usage(&self, used_bytes: u64, capacity_bytes: u64);
    fn update_pending_decodes(&self, pending: usize);
}

#[derive(Debug, Default)]
struct SampleWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        Self { samples: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, value: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn percentile(&self, percentile: f32) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<f32> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        let rank = percentile.clamp(0.0, 1.0) * (sorted.len() - 1) as f32;
        sorted.get(rank.round() as usize).copied().unwrap_or(0.0)
    }
}

#[derive(Debug)]
struct StatsInner {
    started_at: Instant,
    decode_times_ms: SampleWindow,
    decode_chunks: SampleWindow,
    decodes: u64,
    decoded_bytes: u64,
    cache_requests: u64,
    cache_hits: u64,
    cache_bytes_used: u64,
    cache_bytes_capacity: u64,
    pending_decodes: usize,
}

impl Default for StatsInner {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            decode_times_ms: SampleWindow::new(DEFAULT_SAMPLE_CAPACITY),
            decode_chunks: SampleWindow::new(DEFAULT_SAMPLE_CAPACITY),
            decodes: 0,
            decoded_bytes: 0,
            cache_requests: 0,
            cache_hits: 0,
            cache_bytes_used: 0,
            cache_bytes_capacity: 0,
            pending_decodes: 0,
        }
    }
}

/// Thread-safe telemetry sink shared by every loader of an [`crate::loader::AppContext`].
#[derive(Debug, Default)]
pub struct StatsCollector {
    inner: parking_lot::Mutex<StatsInner>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current counters into a serialisable snapshot.
    pub fn snapshot(&self) -> CacheSnapshot {
        let guard = self.inner.lock();

        let cache_requests = guard.cache_requests.max(1);
        let cache_hit_ratio = guard.cache_hits as f32 / cache_requests as f32;

        CacheSnapshot {
            timestamp_ms: now_ms(),
            uptime_ms: guard.started_at.elapsed().as_millis() as u64,
            decodes: guard.decodes,
            decoded_bytes: guard.decoded_bytes,
            decode_time_ms_p50: guard.decode_times_ms.percentile(0.50),
            decode_time_ms_p95: guard.decode_times_ms.percentile(0.95),
            decode_chunks_p50: guard.decode_chunks.percentile(0.50),
            cache_hit_ratio,
            cache_requests: guard.cache_requests,
            cache_bytes_used: guard.cache_bytes_used,
            cache_bytes_capacity: guard.cache_bytes_capacity,
            pending_decodes: guard.pending_decodes,
        }
    }
}

impl TelemetrySink for StatsCollector {
    fn record_decode(&self, duration: Duration) {
        let mut guard = self.inner.lock();
        guard.decodes = guard.decodes.saturating_add(1);
        guard.decode_times_ms.push(duration.as_secs_f64() as f32 * 1_000.0);
    }

    fn record_decode_chunks(&self, chunks: u32, bytes: u64) {
        let mut guard = self.inner.lock();
        guard.decode_chunks.push(chunks as f32);
        guard.decoded_bytes = guard.decoded_bytes.saturating_add(bytes);
    }

    fn record_cache_lookup(&self, hit: bool) {
        let mut guard = self.inner.lock();
        guard.cache_requests = guard.cache_requests.saturating_add(1);
        if hit {
            guard.cache_hits = guard.cache_hits.saturating_add(1);
        }
    }

    fn update_cache_usage(&self, used_bytes: u64, capacity_bytes: u64) {
        let mut guard = self.inner.lock();
        guard.cache_bytes_used = used_bytes;
        guard.cache_bytes_capacity = capacity_bytes;
    }

    fn update_pending_decodes(&self, pending: usize) {
        self.inner.lock().pending_decodes = pending;
    }
}

fn now_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(delta) => delta.as_millis() as u64,
        Err(err) => {
            warn!("system clock error: {err}");
            0
        }
    }
}

/// Point-in-time view of [`StatsCollector`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub timestamp_ms: u64,
    pub uptime_ms: u64,
    pub decodes: u64,
    pub decoded_bytes: u64,
    pub decode_time_ms_p50: f32,
    pub decode_time_ms_p95: f32,
    pub decode_chunks_p50: f32,
    pub cache_hit_ratio: f32,
    pub cache_requests: u64,
    pub cache_bytes_used: u64,
    pub cache_bytes_capacity: u64,
    pub pending_decodes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_percentiles_are_computed() {
        let collector = StatsCollector::new();
        collector.record_decode(Duration::from_millis(10));
        collector.record_decode(Duration::from_millis(20));
        collector.record_decode(Duration::from_millis(30));
        collector.record_decode_chunks(4, 4096);

        let snap = collector.snapshot();
        assert_eq!(snap.decodes, 3);
        assert!(snap.decode_time_ms_p50 >= 19.0 && snap.decode_time_ms_p50 <= 21.0);
        assert!(snap.decode_time_ms_p95 >= snap.decode_time_ms_p50);
        assert_eq!(snap.decoded_bytes, 4096);
        assert_eq!(snap.decode_chunks_p50, 4.0);
    }

    #[test]
    fn cache_metrics_are_tracked() {
        let collector = StatsCollector::new();
        collector.record_cache_lookup(true);
        collector.record_cache_lookup(false);
        collector.update_cache_usage(3 * 1024 * 1024, 5 * 1024 * 1024);
        collector.update_pending_decodes(2);

        let snap = collector.snapshot();
        assert_eq!(snap.cache_requests, 2);
        assert!((snap.cache_hit_ratio - 0.5).abs() < f32::EPSILON);
        assert_eq!(snap.cache_bytes_used, 3 * 1024 * 1024);
        assert_eq!(snap.pending_decodes, 2);

        let json = serde_json::to_value(&snap).expect("serialise snapshot");
        assert_eq!(json["pending_decodes"], 2);
    }
}
