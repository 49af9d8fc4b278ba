//! 流水线控制器 (Pipeline controller)
//!
//! 线程架构:
//! - 采集线程: FrameSource → FrameRing (绝不被推理阻塞)
//! - 推理线程 x N: FrameRing → 预处理 → 推理 → 聚合 → 事件输出
//!
//! The controller owns every thread, the stop flag, and the health state.
//! Degradation (accelerator → CPU) and faults are surfaced through the state
//! cell and counters, never a silent hang.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use crate::aggregate::{DetectionAggregator, DetectionEvent, EventKind};
use crate::backend::{BackendFactory, BackendKind, BackendSet, InferenceBackend, OnnxDetector};
use crate::buffer::FrameRing;
use crate::config::PipelineConfig;
use crate::error::{CaptureError, InferenceError};
use crate::input::{FrameSource, SyntheticSource, ThermalCameraSource, ThermalFrame};
use crate::metrics::{HealthSnapshot, PipelineMetrics, PipelineState};
use crate::preprocess::{transform, ModelSpec};
use crate::BackendPreference;

/// How long capture blocks per camera read before re-checking the stop flag.
const CAPTURE_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// How long workers block per ring pop before re-checking the stop flag.
const WORKER_POP_TIMEOUT: Duration = Duration::from_millis(100);
/// Consecutive engine errors tolerated before the backend is declared dead.
const MAX_CONSECUTIVE_ENGINE_ERRORS: u32 = 5;
/// Exponent cap for the reconnect backoff.
const MAX_BACKOFF_SHIFT: u32 = 6;

pub struct Pipeline {
    stop: Arc<AtomicBool>,
    metrics: Arc<PipelineMetrics>,
    ring: Arc<FrameRing>,
    capture: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Build source and backend from configuration and start all threads.
    pub fn start(config: PipelineConfig, events: Sender<DetectionEvent>) -> Result<Self> {
        config.validate()?;

        let source: Box<dyn FrameSource> = if config.synthetic_source() {
            Box::new(SyntheticSource::ambient(config.camera))
        } else {
            Box::new(
                ThermalCameraSource::open(&config.device, config.camera)
                    .with_context(|| format!("opening thermal camera {}", config.device))?,
            )
        };

        let budget = config.inference_timeout();
        let primary_kind = match config.backend {
            BackendPreference::Cpu => BackendKind::Cpu,
            BackendPreference::Auto | BackendPreference::Cuda => {
                BackendKind::Cuda(config.device_id)
            }
            BackendPreference::Tensorrt => BackendKind::TensorRt(config.device_id),
        };

        let backends = if primary_kind == BackendKind::Cpu {
            let cpu = OnnxDetector::open(&config.model_path, BackendKind::Cpu, budget)?;
            BackendSet::new(Box::new(cpu), None)
        } else {
            let fallback_path = config.model_path.clone();
            let factory: BackendFactory = Box::new(move || {
                OnnxDetector::open(&fallback_path, BackendKind::Cpu, budget)
                    .map(|d| Box::new(d) as Box<dyn InferenceBackend>)
            });
            let primary = OnnxDetector::open(&config.model_path, primary_kind, budget)
                .map(|d| Box::new(d) as Box<dyn InferenceBackend>);
            BackendSet::resolve(primary, Some(factory))?
        };

        Self::start_with(config, source, backends, events)
    }

    /// Start with pre-built source and backends. Used by `start` and by tests
    /// injecting fakes.
    pub fn start_with(
        config: PipelineConfig,
        source: Box<dyn FrameSource>,
        backends: BackendSet,
        events: Sender<DetectionEvent>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(PipelineMetrics::new(config.latency_window));
        metrics.set_state(PipelineState::Starting);

        let ring = Arc::new(FrameRing::with_capacity(config.ring_capacity));
        let stop = Arc::new(AtomicBool::new(false));

        let (input_width, input_height) = backends.input_size();
        let spec = config.model_spec(input_width, input_height);
        let started_degraded = backends.degraded();
        let backend_kind = backends.kind();

        let aggregator = Arc::new(Mutex::new(DetectionAggregator::new(config.aggregator())));
        let backends = Arc::new(Mutex::new(backends));

        // State is published before the threads run so a fault raised on the
        // very first read is never overwritten.
        if started_degraded {
            metrics.set_state(PipelineState::Degraded);
            warn!("pipeline starting degraded on {backend_kind}");
        } else {
            metrics.set_state(PipelineState::Running);
            info!("pipeline starting on {backend_kind}, {} worker(s)", config.workers);
        }

        let capture = {
            let ring = ring.clone();
            let metrics = metrics.clone();
            let stop = stop.clone();
            let max_reconnects = config.max_reconnects;
            let backoff_base = Duration::from_millis(config.reconnect_backoff_ms.max(1));
            thread::Builder::new()
                .name("sentinel-capture".into())
                .spawn(move || {
                    capture_loop(source, ring, metrics, stop, max_reconnects, backoff_base);
                })
                .context("spawning capture thread")?
        };

        let mut workers = Vec::with_capacity(config.workers);
        for worker_index in 0..config.workers {
            let ring = ring.clone();
            let metrics = metrics.clone();
            let stop = stop.clone();
            let backends = backends.clone();
            let aggregator = aggregator.clone();
            let events = events.clone();
            let dump_dir = config.dump_dir.clone();
            let worker = WorkerContext {
                spec,
                calib_lo: config.calib_lo,
                calib_hi: config.calib_hi,
                dump_dir,
            };
            let handle = thread::Builder::new()
                .name(format!("sentinel-worker-{worker_index}"))
                .spawn(move || {
                    worker_loop(worker, ring, metrics, stop, backends, aggregator, events);
                })
                .context("spawning inference worker")?;
            workers.push(handle);
        }

        Ok(Self {
            stop,
            metrics,
            ring,
            capture: Some(capture),
            workers,
        })
    }

    /// Current state plus counters. Cheap; safe to poll.
    pub fn health(&self) -> HealthSnapshot {
        self.metrics.snapshot(self.ring.dropped())
    }

    /// Signal all threads and join them. In-flight frames are completed or
    /// discarded; nothing keeps running afterwards.
    pub fn stop(mut self) -> HealthSnapshot {
        self.shutdown();
        self.health()
    }

    fn shutdown(&mut self) {
        if self.capture.is_none() && self.workers.is_empty() {
            return;
        }
        debug!("stopping pipeline");
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.capture.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        // Faulted is sticky so callers can still see why the pipeline died.
        if self.metrics.state() != PipelineState::Faulted {
            self.metrics.set_state(PipelineState::Stopped);
        }
        info!("pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 采集循环: 读帧 → 入环; 设备错误按指数退避重试, 超限升级为 DeviceLost.
fn capture_loop(
    mut source: Box<dyn FrameSource>,
    ring: Arc<FrameRing>,
    metrics: Arc<PipelineMetrics>,
    stop: Arc<AtomicBool>,
    max_reconnects: u32,
    backoff_base: Duration,
) {
    let mut consecutive_failures: u32 = 0;

    while !stop.load(Ordering::Relaxed) {
        match source.next_frame(CAPTURE_READ_TIMEOUT) {
            Ok(frame) => {
                consecutive_failures = 0;
                metrics.incr_captured();
                if !ring.push(frame) {
                    // Oldest frame evicted; the ring counts it.
                    debug!("ring full, oldest frame evicted");
                }
            }
            // Quiet period, not a failure.
            Err(CaptureError::Timeout(_)) => {}
            Err(CaptureError::DeviceLost { attempts }) => {
                error!("camera reported DeviceLost after {attempts} attempts");
                metrics.set_state(PipelineState::Faulted);
                stop.store(true, Ordering::SeqCst);
                break;
            }
            Err(err) => {
                consecutive_failures += 1;
                if consecutive_failures > max_reconnects {
                    error!(
                        "camera lost after {} reconnect attempts: {err}",
                        max_reconnects
                    );
                    metrics.set_state(PipelineState::Faulted);
                    stop.store(true, Ordering::SeqCst);
                    break;
                }
                metrics.incr_capture_retry();
                let backoff =
                    backoff_base * 2u32.pow((consecutive_failures - 1).min(MAX_BACKOFF_SHIFT));
                warn!(
                    "camera read failed ({err}); retry {}/{} in {:?}",
                    consecutive_failures, max_reconnects, backoff
                );
                sleep_unless_stopped(&stop, backoff);
            }
        }
    }

    source.close();
    debug!("capture thread exited");
}

struct WorkerContext {
    spec: ModelSpec,
    calib_lo: u16,
    calib_hi: u16,
    dump_dir: Option<PathBuf>,
}

/// 推理循环: 出环 → 预处理 → 推理 → 聚合 → 事件.
/// Per-frame errors drop the frame and continue; fatal backend errors
/// downgrade to the standby CPU backend or fault the pipeline.
fn worker_loop(
    ctx: WorkerContext,
    ring: Arc<FrameRing>,
    metrics: Arc<PipelineMetrics>,
    stop: Arc<AtomicBool>,
    backends: Arc<Mutex<BackendSet>>,
    aggregator: Arc<Mutex<DetectionAggregator>>,
    events: Sender<DetectionEvent>,
) {
    let mut consecutive_engine_errors: u32 = 0;

    while !stop.load(Ordering::Relaxed) {
        let Some(frame) = ring.pop(WORKER_POP_TIMEOUT) else {
            continue;
        };

        let tensor = match transform(&frame, &ctx.spec) {
            Ok(tensor) => tensor,
            Err(err) => {
                metrics.incr_malformed();
                warn!("dropping frame: {err}");
                continue;
            }
        };

        let started = Instant::now();
        let result = backends.lock().unwrap().detect(&tensor);
        match result {
            Ok(detections) => {
                consecutive_engine_errors = 0;
                metrics.record_inference_ms(started.elapsed().as_secs_f64() as f32 * 1000.0);
                metrics.incr_processed();

                let emitted = aggregator.lock().unwrap().observe(
                    frame.seq,
                    frame.captured_at,
                    detections,
                );
                if emitted.is_empty() {
                    continue;
                }
                metrics.add_events(emitted.len() as u64);
                for event in emitted {
                    info!(
                        "{:?}: {} (conf {:.2}) at frame #{}",
                        event.kind, event.label, event.confidence, event.frame_seq
                    );
                    if event.kind == EventKind::Raised {
                        if let Some(dir) = &ctx.dump_dir {
                            if let Err(err) =
                                snapshot_png(&frame, ctx.calib_lo, ctx.calib_hi, dir)
                            {
                                warn!("frame snapshot failed: {err:#}");
                            }
                        }
                    }
                    if events.send(event).is_err() {
                        debug!("event sink closed");
                    }
                }
            }
            Err(InferenceError::Timeout { elapsed, budget }) => {
                // Dropped, never retried; a late answer is a wrong answer here.
                metrics.incr_inference_timeout();
                warn!(
                    "frame #{} dropped: inference {:?} over {:?} budget",
                    frame.seq, elapsed, budget
                );
            }
            Err(InferenceError::AcceleratorInit(reason)) => {
                metrics.incr_inference_error();
                downgrade_or_fault(&backends, &metrics, &stop, &reason);
            }
            Err(InferenceError::Engine(reason)) => {
                metrics.incr_inference_error();
                consecutive_engine_errors += 1;
                warn!(
                    "inference error on frame #{} ({}/{}): {reason}",
                    frame.seq, consecutive_engine_errors, MAX_CONSECUTIVE_ENGINE_ERRORS
                );
                if consecutive_engine_errors >= MAX_CONSECUTIVE_ENGINE_ERRORS {
                    consecutive_engine_errors = 0;
                    downgrade_or_fault(&backends, &metrics, &stop, &reason);
                }
            }
        }
    }

    debug!("inference worker exited");
}

fn downgrade_or_fault(
    backends: &Arc<Mutex<BackendSet>>,
    metrics: &Arc<PipelineMetrics>,
    stop: &Arc<AtomicBool>,
    reason: &str,
) {
    let mut set = backends.lock().unwrap();
    match set.downgrade() {
        Ok(kind) => {
            warn!("backend downgraded to {kind} after fatal error: {reason}");
            metrics.set_state(PipelineState::Degraded);
        }
        Err(err) => {
            error!("no viable backend left ({reason}): {err}");
            metrics.set_state(PipelineState::Faulted);
            stop.store(true, Ordering::SeqCst);
        }
    }
}

/// Sleep in short slices so stop() stays responsive during backoff.
fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) {
    let slice = Duration::from_millis(20);
    let deadline = Instant::now() + total;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || stop.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(slice.min(remaining));
    }
}

/// Normalized PNG snapshot of a raw frame, for field debugging.
fn snapshot_png(frame: &ThermalFrame, lo: u16, hi: u16, dir: &Path) -> Result<PathBuf> {
    let span = (hi.saturating_sub(lo)).max(1) as f32;
    let buf: Vec<u8> = frame
        .pixels
        .iter()
        .map(|&p| (((p as f32 - lo as f32) / span).clamp(0.0, 1.0) * 255.0) as u8)
        .collect();
    let img = image::GrayImage::from_raw(frame.width, frame.height, buf)
        .context("snapshot buffer mismatch")?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("frame_{:08}.png", frame.seq));
    img.save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
