//! 热感视频输入系统 (Thermal input system)
//!
//! 独立采集源,统一拉取接口:
//! - ThermalCameraSource: v4l2 热感摄像头 (ffmpeg 采集)
//! - SyntheticSource: 合成热感场景 (测试/烧机)
pub mod capture;
pub mod synthetic;
pub mod thermal;

pub use synthetic::SyntheticSource;
pub use thermal::ThermalCameraSource;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Geometry and cadence of the configured camera, queried/configured at open
/// time. Preprocessing validates every frame against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraProfile {
    pub width: u32,
    pub height: u32,
    /// Native cadence of the sensor, frames per second.
    pub fps: u32,
}

impl Default for CameraProfile {
    fn default() -> Self {
        // 常见热感分辨率 320x240 @ 9Hz
        Self {
            width: 320,
            height: 240,
            fps: 9,
        }
    }
}

/// One captured thermal frame. Immutable after creation; ownership moves
/// through the pipeline, it is never shared mutably.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalFrame {
    /// Strictly increasing per source.
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// Raw sensor counts, row-major, one u16 per pixel.
    pub pixels: Vec<u16>,
}

impl ThermalFrame {
    pub fn new(seq: u64, width: u32, height: u32, pixels: Vec<u16>) -> Self {
        Self {
            seq,
            captured_at: Utc::now(),
            width,
            height,
            pixels,
        }
    }
}

/// Pull interface over an opaque camera capability. Implementations own the
/// device handle; nothing else in the pipeline touches the SDK.
pub trait FrameSource: Send {
    /// Profile the source was opened with.
    fn profile(&self) -> CameraProfile;

    /// Block for the next frame, at most `timeout`.
    ///
    /// `Timeout` is not an error condition for the caller beyond retrying;
    /// `Device` errors are retried by the capture thread with backoff.
    fn next_frame(&mut self, timeout: Duration) -> Result<ThermalFrame, CaptureError>;

    /// Release the device. Called once on pipeline stop.
    fn close(&mut self) {}
}
