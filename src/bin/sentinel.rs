//! 热感哨兵 (Thermal Sentinel)
//!
//! 系统架构:
//! 1. 采集线程: 热感摄像头读帧 (流水线内部管理)
//! 2. 推理线程: 预处理 → 检测 → 聚合 (流水线内部管理)
//! 3. 主线程:   事件落盘 + 周期统计

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use tracing_subscriber::EnvFilter;

use thermal_sentinel::config::Args;
use thermal_sentinel::{
    gen_time_string, DetectionEvent, EventKind, Pipeline, PipelineConfig, PipelineState,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = PipelineConfig::from_args(&args)?;

    println!("🚀 热感哨兵系统启动");
    println!("📦 检测模型: {}", config.model_path.display());
    println!(
        "📷 输入源: {} ({}x{} @ {} fps)",
        config.device, config.camera.width, config.camera.height, config.camera.fps
    );
    println!(
        "🎯 阈值: conf={} iou={} | 去抖动: K={} M={}",
        config.conf_threshold, config.iou_threshold, config.promote_frames, config.release_frames
    );
    println!();

    let mut event_log = args
        .events_log
        .as_deref()
        .map(open_event_log)
        .transpose()?;

    let (event_tx, event_rx) = crossbeam_channel::unbounded::<DetectionEvent>();
    let pipeline = Pipeline::start(config, event_tx)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_shutdown.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    println!("✅ 系统就绪, 开始监控... (Ctrl+C 退出)\n");

    let stats_every = Duration::from_secs(args.stats_interval_secs.max(1));
    let mut last_stats = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        match event_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                report_event(&event);
                if let Some(log) = event_log.as_mut() {
                    let line = serde_json::to_string(&event)?;
                    writeln!(log, "{line}")?;
                    log.flush()?;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            // All workers gone; the stats branch below reports why.
            Err(RecvTimeoutError::Disconnected) => {}
        }

        if last_stats.elapsed() >= stats_every {
            last_stats = Instant::now();
            let health = pipeline.health();
            println!(
                "Stats: State={:?} | Received={} | Dropped={} | Drop Rate={:.1}% | Inference p50={:.1}ms p95={:.1}ms",
                health.state,
                health.frames_captured,
                health.frames_dropped,
                health.drop_rate() * 100.0,
                health.inference_latency.p50_ms,
                health.inference_latency.p95_ms,
            );
            if health.state == PipelineState::Faulted {
                eprintln!("❌ 流水线故障, 退出监控循环");
                break;
            }
        }
    }

    println!("\nShutting down...");
    let stats = pipeline.stop();

    println!("\nFinal Stats:");
    println!("  State: {:?}", stats.state);
    println!("  Total frames received: {}", stats.frames_captured);
    println!("  Total frames dropped: {}", stats.frames_dropped);
    println!("  Drop rate: {:.2}%", stats.drop_rate() * 100.0);
    println!("  Frames processed: {}", stats.frames_processed);
    println!("  Inference timeouts: {}", stats.inference_timeouts);
    println!("  Events emitted: {}", stats.events_emitted);

    Ok(())
}

fn report_event(event: &DetectionEvent) {
    match event.kind {
        EventKind::Raised => println!(
            "🚨 {} detected (conf {:.2}) at frame #{} [{:.0},{:.0} {:.0}x{:.0}]",
            event.label,
            event.confidence,
            event.frame_seq,
            event.bbox.xmin(),
            event.bbox.ymin(),
            event.bbox.width(),
            event.bbox.height(),
        ),
        EventKind::Cleared => println!(
            "✓ {} cleared at frame #{}",
            event.label, event.frame_seq
        ),
    }
}

/// Open the JSONL event log with a timestamped name next to the requested
/// path, e.g. `logs/events.jsonl` → `logs/events_20260807101500.jsonl`.
fn open_event_log(requested: &str) -> Result<File> {
    let requested = Path::new(requested);
    if let Some(parent) = requested.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let stem = requested
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("events");
    let ext = requested
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("jsonl");
    let stamped = format!("{stem}_{}.{ext}", gen_time_string(""));
    let path = requested.with_file_name(stamped);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening event log {}", path.display()))?;
    println!("📝 事件日志: {}", path.display());
    Ok(file)
}
