//! 运行状态与计数器 (Pipeline state and counters)
//!
//! One process-wide struct, atomics only on the hot path. Written by the
//! pipeline's own threads, read by anyone holding the Arc; the health snapshot
//! is the sole vehicle for surfacing degraded operation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Lifecycle of the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    /// Still producing events, on a reduced capability (CPU fallback).
    Degraded,
    /// Stopped on a fatal error; counters retain their final values.
    Faulted,
}

impl PipelineState {
    fn as_u8(self) -> u8 {
        match self {
            PipelineState::Stopped => 0,
            PipelineState::Starting => 1,
            PipelineState::Running => 2,
            PipelineState::Degraded => 3,
            PipelineState::Faulted => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => PipelineState::Starting,
            2 => PipelineState::Running,
            3 => PipelineState::Degraded,
            4 => PipelineState::Faulted,
            _ => PipelineState::Stopped,
        }
    }
}

/// Sliding window of recent inference latencies.
struct LatencyWindow {
    samples: VecDeque<f32>,
    cap: usize,
}

impl LatencyWindow {
    fn record(&mut self, ms: f32) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    fn percentile(sorted: &[f32], p: f32) -> f32 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((p / 100.0) * (sorted.len() - 1) as f32).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn stats(&self) -> LatencyStats {
        if self.samples.is_empty() {
            return LatencyStats::default();
        }
        let mut sorted: Vec<f32> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mean = sorted.iter().sum::<f32>() / sorted.len() as f32;
        LatencyStats {
            mean_ms: mean,
            p50_ms: Self::percentile(&sorted, 50.0),
            p95_ms: Self::percentile(&sorted, 95.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub mean_ms: f32,
    pub p50_ms: f32,
    pub p95_ms: f32,
}

pub struct PipelineMetrics {
    state: AtomicU8,
    frames_captured: AtomicU64,
    frames_processed: AtomicU64,
    malformed_frames: AtomicU64,
    inference_timeouts: AtomicU64,
    inference_errors: AtomicU64,
    capture_retries: AtomicU64,
    events_emitted: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl PipelineMetrics {
    pub fn new(latency_window: usize) -> Self {
        Self {
            state: AtomicU8::new(PipelineState::Stopped.as_u8()),
            frames_captured: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            inference_timeouts: AtomicU64::new(0),
            inference_errors: AtomicU64::new(0),
            capture_retries: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow {
                samples: VecDeque::with_capacity(latency_window),
                cap: latency_window.max(1),
            }),
        }
    }

    pub fn set_state(&self, state: PipelineState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn incr_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_inference_timeout(&self) {
        self.inference_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_inference_error(&self) {
        self.inference_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_capture_retry(&self) {
        self.capture_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events(&self, n: u64) {
        self.events_emitted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn inference_timeouts(&self) -> u64 {
        self.inference_timeouts.load(Ordering::Relaxed)
    }

    pub fn record_inference_ms(&self, ms: f32) {
        if let Ok(mut window) = self.latency.lock() {
            window.record(ms);
        }
    }

    /// Point-in-time view; `frames_dropped` comes from the ring buffer, which
    /// owns the overflow counter.
    pub fn snapshot(&self, frames_dropped: u64) -> HealthSnapshot {
        let latency = self
            .latency
            .lock()
            .map(|w| w.stats())
            .unwrap_or_default();
        HealthSnapshot {
            state: self.state(),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped,
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            inference_timeouts: self.inference_timeouts.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            capture_retries: self.capture_retries.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            inference_latency: latency,
        }
    }
}

/// Everything the observability surface exposes, in one serializable record.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: PipelineState,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub malformed_frames: u64,
    pub inference_timeouts: u64,
    pub inference_errors: u64,
    pub capture_retries: u64,
    pub events_emitted: u64,
    pub inference_latency: LatencyStats,
}

impl HealthSnapshot {
    pub fn drop_rate(&self) -> f64 {
        self.frames_dropped as f64 / self.frames_captured.max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        let m = PipelineMetrics::new(8);
        assert_eq!(m.state(), PipelineState::Stopped);
        for state in [
            PipelineState::Starting,
            PipelineState::Running,
            PipelineState::Degraded,
            PipelineState::Faulted,
            PipelineState::Stopped,
        ] {
            m.set_state(state);
            assert_eq!(m.state(), state);
        }
    }

    #[test]
    fn test_latency_stats() {
        let m = PipelineMetrics::new(10);
        for ms in [10.0, 20.0, 30.0, 40.0, 100.0] {
            m.record_inference_ms(ms);
        }
        let stats = m.snapshot(0).inference_latency;
        assert_eq!(stats.mean_ms, 40.0);
        assert_eq!(stats.p50_ms, 30.0);
        assert_eq!(stats.p95_ms, 100.0);
    }

    #[test]
    fn test_latency_window_bounded() {
        let m = PipelineMetrics::new(3);
        for ms in [1.0, 2.0, 3.0, 4.0, 5.0] {
            m.record_inference_ms(ms);
        }
        // only the last 3 samples remain
        assert_eq!(m.snapshot(0).inference_latency.mean_ms, 4.0);
    }

    #[test]
    fn test_snapshot_counters() {
        let m = PipelineMetrics::new(4);
        m.incr_captured();
        m.incr_captured();
        m.incr_processed();
        m.incr_inference_timeout();
        let snap = m.snapshot(7);
        assert_eq!(snap.frames_captured, 2);
        assert_eq!(snap.frames_processed, 1);
        assert_eq!(snap.inference_timeouts, 1);
        assert_eq!(snap.frames_dropped, 7);
        assert!((snap.drop_rate() - 3.5).abs() < 1e-9);
    }
}
