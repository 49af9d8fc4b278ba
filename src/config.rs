//! 配置参数 (Configuration surface)
//!
//! CLI arguments for the `sentinel` binary plus the validated pipeline
//! configuration the library consumes. Validation rejects nonsense up front;
//! nothing downstream re-checks ranges.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregatorConfig;
use crate::backend::BackendPreference;
use crate::input::CameraProfile;
use crate::preprocess::ModelSpec;

/// 热感哨兵参数
#[derive(Parser, Debug)]
#[command(author, version, about = "热感哨兵 - Thermal Sentinel", long_about = None)]
pub struct Args {
    /// 摄像头设备路径, 或 "synthetic" 合成场景
    #[arg(short, long, default_value = "/dev/video0")]
    pub source: String,

    /// ONNX检测模型路径
    #[arg(short, long, default_value = "models/thermal-det.onnx")]
    pub model: String,

    /// 摄像头分辨率宽度
    #[arg(long, default_value_t = 320)]
    pub width: u32,

    /// 摄像头分辨率高度
    #[arg(long, default_value_t = 240)]
    pub height: u32,

    /// 摄像头帧率
    #[arg(long, default_value_t = 9)]
    pub fps: u32,

    /// 置信度阈值 θ
    #[arg(long, default_value_t = 0.5)]
    pub conf: f32,

    /// NMS IoU 阈值 τ
    #[arg(long, default_value_t = 0.45)]
    pub iou: f32,

    /// 连续K帧确认后触发事件
    #[arg(long, default_value_t = 3)]
    pub promote: u32,

    /// 连续M帧缺席后解除事件
    #[arg(long, default_value_t = 6)]
    pub release: u32,

    /// 帧环形缓冲容量
    #[arg(long, default_value_t = 4)]
    pub ring_capacity: usize,

    /// 单帧推理超时 (ms)
    #[arg(long, default_value_t = 250)]
    pub inference_timeout_ms: u64,

    /// 推理后端: auto / cpu / cuda / tensorrt
    #[arg(long, value_enum, default_value_t = BackendPreference::Auto)]
    pub backend: BackendPreference,

    /// 加速器设备ID
    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// 推理工作线程数
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// 传感器标定下界 (counts → 0.0)
    #[arg(long, default_value_t = 7000)]
    pub calib_lo: u16,

    /// 传感器标定上界 (counts → 1.0)
    #[arg(long, default_value_t = 10000)]
    pub calib_hi: u16,

    /// 类别标签, 逗号分隔 (默认 animal,person)
    #[arg(long)]
    pub classes: Option<String>,

    /// 统计打印间隔 (秒)
    #[arg(long, default_value_t = 5)]
    pub stats_interval_secs: u64,

    /// 事件JSONL日志路径 (默认不落盘)
    #[arg(long)]
    pub events_log: Option<String>,

    /// 触发事件时输出帧快照PNG的目录
    #[arg(long)]
    pub dump_frames: Option<String>,
}

/// Validated library-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Camera device path, or `synthetic` for the built-in scene source.
    pub device: String,
    pub camera: CameraProfile,
    pub model_path: PathBuf,
    pub class_names: Vec<String>,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub promote_frames: u32,
    pub release_frames: u32,
    pub ring_capacity: usize,
    pub inference_timeout_ms: u64,
    pub backend: BackendPreference,
    pub device_id: i32,
    pub workers: usize,
    pub calib_lo: u16,
    pub calib_hi: u16,
    /// Bounded reconnect attempts before `DeviceLost`.
    pub max_reconnects: u32,
    /// Exponential backoff base between reconnect attempts.
    pub reconnect_backoff_ms: u64,
    /// Samples kept for the latency percentiles.
    pub latency_window: usize,
    /// Directory for per-event frame snapshots.
    pub dump_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            camera: CameraProfile::default(),
            model_path: PathBuf::from("models/thermal-det.onnx"),
            class_names: crate::DEFAULT_CLASS_NAMES.clone(),
            conf_threshold: 0.5,
            iou_threshold: 0.45,
            promote_frames: 3,
            release_frames: 6,
            ring_capacity: 4,
            inference_timeout_ms: 250,
            backend: BackendPreference::Auto,
            device_id: 0,
            workers: 1,
            calib_lo: 7000,
            calib_hi: 10000,
            max_reconnects: 5,
            reconnect_backoff_ms: 100,
            latency_window: 120,
            dump_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let class_names = match &args.classes {
            Some(spec) => spec
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => crate::DEFAULT_CLASS_NAMES.clone(),
        };
        let config = Self {
            device: args.source.clone(),
            camera: CameraProfile {
                width: args.width,
                height: args.height,
                fps: args.fps,
            },
            model_path: PathBuf::from(&args.model),
            class_names,
            conf_threshold: args.conf,
            iou_threshold: args.iou,
            promote_frames: args.promote,
            release_frames: args.release,
            ring_capacity: args.ring_capacity,
            inference_timeout_ms: args.inference_timeout_ms,
            backend: args.backend,
            device_id: args.device_id,
            workers: args.workers,
            calib_lo: args.calib_lo,
            calib_hi: args.calib_hi,
            dump_dir: args.dump_frames.as_ref().map(PathBuf::from),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            bail!(
                "confidence threshold must be between 0 and 1, got {}",
                self.conf_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            bail!("IoU threshold must be between 0 and 1, got {}", self.iou_threshold);
        }
        if self.promote_frames == 0 || self.release_frames == 0 {
            bail!("promote/release frame counts must be at least 1");
        }
        if self.ring_capacity == 0 {
            bail!("ring capacity must be at least 1");
        }
        if self.workers == 0 {
            bail!("worker count must be at least 1");
        }
        if self.inference_timeout_ms == 0 {
            bail!("inference timeout must be positive");
        }
        if self.calib_hi <= self.calib_lo {
            bail!(
                "calibration bounds inverted: lo {} >= hi {}",
                self.calib_lo,
                self.calib_hi
            );
        }
        if self.camera.width == 0 || self.camera.height == 0 || self.camera.fps == 0 {
            bail!("camera profile must have non-zero geometry and fps");
        }
        Ok(())
    }

    pub fn synthetic_source(&self) -> bool {
        self.device == "synthetic"
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            conf_threshold: self.conf_threshold,
            iou_threshold: self.iou_threshold,
            promote_frames: self.promote_frames,
            release_frames: self.release_frames,
            class_names: self.class_names.clone(),
        }
    }

    /// Model spec once the detector reports its input geometry.
    pub fn model_spec(&self, input_width: u32, input_height: u32) -> ModelSpec {
        ModelSpec {
            input_width,
            input_height,
            camera: self.camera,
            calib_lo: self.calib_lo,
            calib_hi: self.calib_hi,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_confidence() {
        let config = PipelineConfig {
            conf_threshold: 1.5,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_debounce() {
        let config = PipelineConfig {
            promote_frames: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_calibration() {
        let config = PipelineConfig {
            calib_lo: 9000,
            calib_hi: 8000,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_ring() {
        let config = PipelineConfig {
            ring_capacity: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
