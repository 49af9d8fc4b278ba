//! 热感摄像头源 - v4l2 采集 (ffmpeg)
//!
//! The only file that knows the capture SDK. The ffmpeg context pushes frames
//! through [`CaptureFilter`] into a small hand-off channel; this adapter turns
//! that into the pull-mode [`FrameSource`] contract and assigns sequence
//! numbers. A dead context is rebuilt lazily on the next read, so the capture
//! thread's backoff policy stays in charge of retry pacing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use tracing::{debug, info};

use super::capture::{CaptureFilter, RawCapture};
use super::{CameraProfile, FrameSource, ThermalFrame};
use crate::error::CaptureError;

/// Capacity of the SDK hand-off channel. One in flight, one spare; the ring
/// buffer downstream is where real queueing policy lives.
const HANDOFF_CAPACITY: usize = 2;

pub struct ThermalCameraSource {
    device: String,
    profile: CameraProfile,
    tx: Sender<RawCapture>,
    rx: Receiver<RawCapture>,
    stop: Arc<AtomicBool>,
    /// Cleared by the context thread when the ffmpeg run ends.
    alive: Arc<AtomicBool>,
    next_seq: u64,
}

impl ThermalCameraSource {
    /// Open the camera at `device` (e.g. `/dev/video0`) with the configured
    /// profile. Fails with `DeviceUnavailable` when the context cannot start.
    pub fn open(device: &str, profile: CameraProfile) -> Result<Self, CaptureError> {
        let (tx, rx) = crossbeam_channel::bounded(HANDOFF_CAPACITY);
        let mut source = Self {
            device: device.to_string(),
            profile,
            tx,
            rx,
            stop: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(false)),
            next_seq: 0,
        };
        source
            .spawn_context()
            .map_err(|e| CaptureError::DeviceUnavailable {
                device: device.to_string(),
                reason: e,
            })?;
        info!(
            "thermal camera open: {} {}x{} @ {} fps",
            device, profile.width, profile.height, profile.fps
        );
        Ok(source)
    }

    /// Build and start one ffmpeg capture run. Returns once the run is live;
    /// a helper thread parks on the scheduler and flips `alive` on exit.
    fn spawn_context(&mut self) -> Result<(), String> {
        let filter = CaptureFilter::new(self.tx.clone(), self.stop.clone());
        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("capture", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        let video_size = format!("{}x{}", self.profile.width, self.profile.height);
        let framerate = self.profile.fps.to_string();
        let input = Input::new(self.device.as_str()).set_format("v4l2").set_input_opts(
            [
                ("input_format", "gray16le"),
                ("video_size", video_size.as_str()),
                ("framerate", framerate.as_str()),
            ]
            .into(),
        );

        let ctx = FfmpegContext::builder()
            .input(input)
            .output(out)
            .build()
            .map_err(|e| e.to_string())?;
        let sch = ctx.start().map_err(|e| e.to_string())?;

        self.alive.store(true, Ordering::SeqCst);
        let alive = self.alive.clone();
        std::thread::Builder::new()
            .name("thermal-capture".into())
            .spawn(move || {
                let _ = sch.wait();
                alive.store(false, Ordering::SeqCst);
                debug!("capture context ended");
            })
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn wrap(&mut self, raw: RawCapture) -> ThermalFrame {
        self.next_seq += 1;
        ThermalFrame {
            seq: self.next_seq,
            captured_at: raw.captured_at,
            width: raw.width,
            height: raw.height,
            pixels: raw.pixels,
        }
    }
}

impl FrameSource for ThermalCameraSource {
    fn profile(&self) -> CameraProfile {
        self.profile
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<ThermalFrame, CaptureError> {
        if !self.alive.load(Ordering::SeqCst) && !self.stop.load(Ordering::SeqCst) {
            // Context died (device unplugged, USB reset). One rebuild attempt
            // per call; pacing is the capture thread's job.
            self.spawn_context().map_err(CaptureError::Device)?;
        }

        match self.rx.recv_timeout(timeout) {
            Ok(raw) => Ok(self.wrap(raw)),
            Err(RecvTimeoutError::Timeout) => {
                if self.alive.load(Ordering::SeqCst) {
                    Err(CaptureError::Timeout(timeout))
                } else {
                    Err(CaptureError::Device("capture context ended".to_string()))
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(CaptureError::Device("capture channel closed".to_string()))
            }
        }
    }

    fn close(&mut self) {
        // The filter sees the flag and errors out of the ffmpeg run.
        self.stop.store(true, Ordering::SeqCst);
    }
}
