//! FFmpeg采集过滤器: v4l2 gray16le 帧 → 原始热感数据
//! Capture filter bridging the ffmpeg frame callback into a bounded channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};
use tracing::{debug, warn};

/// Raw capture as it leaves the SDK callback, before the source adapter
/// assigns a pipeline sequence number.
pub struct RawCapture {
    pub pixels: Vec<u16>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

/// Runs inside the ffmpeg decode thread. Must stay fast: validate, copy the
/// plane, hand off. Everything else happens pipeline-side.
#[derive(Clone)]
pub struct CaptureFilter {
    tx: Sender<RawCapture>,
    stop: Arc<AtomicBool>,
    total_frames: usize,
    dropped_frames: usize,
    count: usize,
    last: Instant,
}

impl CaptureFilter {
    pub fn new(tx: Sender<RawCapture>, stop: Arc<AtomicBool>) -> Self {
        Self {
            tx,
            stop,
            total_frames: 0,
            dropped_frames: 0,
            count: 0,
            last: Instant::now(),
        }
    }
}

impl FrameFilter for CaptureFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        debug!("capture filter started");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        if self.stop.load(Ordering::Relaxed) {
            return Err("capture stopped".to_string());
        }

        unsafe {
            self.total_frames += 1;

            // 空帧或损坏帧
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.dropped_frames += 1;
                return Ok(None);
            }

            let w = (*frame.as_ptr()).width as u32;
            let h = (*frame.as_ptr()).height as u32;

            // 分辨率合法性
            if w == 0 || h == 0 || w > 4096 || h > 4096 {
                self.dropped_frames += 1;
                if self.total_frames <= 10 {
                    warn!("discarding frame #{}: bad resolution {}x{}", self.total_frames, w, h);
                }
                return Ok(None);
            }

            let plane = (*frame.as_ptr()).data[0];
            let stride = (*frame.as_ptr()).linesize[0] as usize;

            // gray16le: 2 bytes per pixel
            if plane.is_null() || stride < w as usize * 2 {
                self.dropped_frames += 1;
                if self.total_frames <= 10 {
                    warn!("discarding frame #{}: bad plane/stride {}", self.total_frames, stride);
                }
                return Ok(None);
            }

            let captured_at = Utc::now();
            let w_usize = w as usize;
            let h_usize = h as usize;
            let mut pixels = vec![0u16; w_usize * h_usize];
            for row in 0..h_usize {
                let row_ptr = plane.add(row * stride);
                for col in 0..w_usize {
                    let lo = *row_ptr.add(col * 2);
                    let hi = *row_ptr.add(col * 2 + 1);
                    pixels[row * w_usize + col] = u16::from_le_bytes([lo, hi]);
                }
            }

            self.count += 1;
            if self.last.elapsed().as_secs_f64() >= 5.0 {
                let fps = self.count as f64 / self.last.elapsed().as_secs_f64();
                debug!(
                    "capture: {:.1} fps, total {}, discarded {}",
                    fps, self.total_frames, self.dropped_frames
                );
                self.last = Instant::now();
                self.count = 0;
            }

            // Queueing policy lives in the ring downstream, not here.
            if self
                .tx
                .try_send(RawCapture {
                    pixels,
                    width: w,
                    height: h,
                    captured_at,
                })
                .is_err()
            {
                self.dropped_frames += 1;
            }

            Ok(Some(frame))
        }
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        debug!("capture filter exited");
    }
}
