//! 错误类型 (Error taxonomy)
//!
//! Per-frame errors are recovered locally by the worker that hit them;
//! device-level errors escalate to the pipeline controller.

use std::time::Duration;

use thiserror::Error;

/// Camera-side failures.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device could not be opened at all.
    #[error("thermal camera unavailable at {device:?}: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    /// No frame arrived within the requested window. Normal during startup.
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    /// A read failed mid-stream; the capture thread retries with backoff.
    #[error("camera read failed: {0}")]
    Device(String),

    /// Bounded reconnect attempts exhausted; the pipeline stops on this.
    #[error("thermal camera lost after {attempts} reconnect attempts")]
    DeviceLost { attempts: u32 },
}

/// Inference-side failures.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Accelerator missing or the model is not usable on it. Triggers CPU
    /// fallback, never a pipeline abort.
    #[error("accelerator init failed: {0}")]
    AcceleratorInit(String),

    /// The latency budget was exceeded; the frame is dropped, never retried.
    #[error("inference took {elapsed:?}, budget {budget:?}")]
    Timeout { elapsed: Duration, budget: Duration },

    /// Engine-level failure on one frame.
    #[error("inference engine error: {0}")]
    Engine(String),
}

/// Preprocessing failures.
#[derive(Debug, Error)]
pub enum PreprocessError {
    /// Frame geometry does not match the configured camera profile. Surfaced
    /// instead of silently producing a corrupt tensor.
    #[error("malformed frame #{seq}: got {got_width}x{got_height} ({got_len} px), profile {want_width}x{want_height}")]
    MalformedFrame {
        seq: u64,
        got_width: u32,
        got_height: u32,
        got_len: usize,
        want_width: u32,
        want_height: u32,
    },
}
