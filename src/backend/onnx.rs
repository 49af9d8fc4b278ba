//! ONNX检测器 (ONNX detector)
//!
//! One `ort` session per backend instance. Model geometry (input size, class
//! count, output layout) is extracted and validated at load time so a
//! mismatched artifact fails fast instead of mis-decoding at runtime.

use std::path::Path;
use std::time::{Duration, Instant};

use ort::execution_providers::{
    CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider,
};
use ort::session::Session;
use tracing::{debug, info};

use super::{BackendKind, InferenceBackend};
use crate::error::InferenceError;
use crate::preprocess::TensorInput;
use crate::{Bbox, Detection};

/// Candidates below this floor never leave the decoder; the aggregator applies
/// the configured confidence threshold on top.
const RAW_CONF_FLOOR: f32 = 0.05;

/// Upper bound on candidates handed downstream per frame.
const MAX_CANDIDATES: usize = 300;

/// Model geometry extracted at load time.
#[derive(Debug, Clone, Copy)]
struct ModelIo {
    input_width: u32,
    input_height: u32,
    num_classes: usize,
    /// 4 box coords + num_classes.
    output_features: usize,
}

pub struct OnnxDetector {
    session: Session,
    kind: BackendKind,
    io: ModelIo,
    budget: Duration,
}

impl OnnxDetector {
    /// Load `model_path` on the given backend. Accelerator kinds validate the
    /// execution provider up front and fail with `AcceleratorInit` so the
    /// caller can fall back instead of aborting.
    pub fn open(
        model_path: &Path,
        kind: BackendKind,
        budget: Duration,
    ) -> Result<Self, InferenceError> {
        let builder = Session::builder()
            .map_err(|e| InferenceError::Engine(format!("session builder: {e}")))?;

        let session = match kind {
            BackendKind::Cpu => builder
                .commit_from_file(model_path)
                .map_err(|e| InferenceError::Engine(format!("model load: {e}")))?,
            BackendKind::Cuda(device_id) => {
                let ep = CUDAExecutionProvider::default().with_device_id(device_id);
                if !ep.is_available().unwrap_or(false) {
                    return Err(InferenceError::AcceleratorInit(format!(
                        "CUDA device {device_id} not available"
                    )));
                }
                builder
                    .with_execution_providers([ep.build().error_on_failure()])
                    .map_err(|e| InferenceError::AcceleratorInit(e.to_string()))?
                    .commit_from_file(model_path)
                    .map_err(|e| InferenceError::AcceleratorInit(e.to_string()))?
            }
            BackendKind::TensorRt(device_id) => {
                let ep = TensorRTExecutionProvider::default().with_device_id(device_id);
                if !ep.is_available().unwrap_or(false) {
                    return Err(InferenceError::AcceleratorInit(format!(
                        "TensorRT device {device_id} not available"
                    )));
                }
                builder
                    .with_execution_providers([ep.build().error_on_failure()])
                    .map_err(|e| InferenceError::AcceleratorInit(e.to_string()))?
                    .commit_from_file(model_path)
                    .map_err(|e| InferenceError::AcceleratorInit(e.to_string()))?
            }
        };

        let io = Self::extract_model_io(&session)?;
        info!(
            "model loaded on {}: input {}x{}, {} classes",
            kind, io.input_width, io.input_height, io.num_classes
        );

        Ok(Self {
            session,
            kind,
            io,
            budget,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.io.num_classes
    }

    fn extract_model_io(session: &Session) -> Result<ModelIo, InferenceError> {
        let input = session
            .inputs
            .first()
            .ok_or_else(|| InferenceError::Engine("model has no inputs".to_string()))?;
        let input_dims: Vec<i64> = input
            .input_type
            .tensor_dimensions()
            .ok_or_else(|| InferenceError::Engine("model input is not a tensor".to_string()))?
            .to_vec();

        // [batch, channels, height, width]
        if input_dims.len() != 4 {
            return Err(InferenceError::Engine(format!(
                "expected 4D model input, got {}D",
                input_dims.len()
            )));
        }
        let (input_height, input_width) = (input_dims[2], input_dims[3]);
        if !(1..=4096).contains(&input_height) || !(1..=4096).contains(&input_width) {
            return Err(InferenceError::Engine(format!(
                "implausible model input {input_width}x{input_height}"
            )));
        }

        let output = session
            .outputs
            .first()
            .ok_or_else(|| InferenceError::Engine("model has no outputs".to_string()))?;
        let output_dims: Vec<i64> = output
            .output_type
            .tensor_dimensions()
            .ok_or_else(|| InferenceError::Engine("model output is not a tensor".to_string()))?
            .to_vec();

        // [1, 4+nc, N] or [1, N, 4+nc]
        if output_dims.len() != 3 {
            return Err(InferenceError::Engine(format!(
                "expected 3D model output, got {}D",
                output_dims.len()
            )));
        }
        let output_features = output_dims[1].min(output_dims[2]) as usize;
        if output_features < 5 {
            return Err(InferenceError::Engine(format!(
                "model output features too small: {output_features}"
            )));
        }

        Ok(ModelIo {
            input_width: input_width as u32,
            input_height: input_height as u32,
            num_classes: output_features - 4,
            output_features,
        })
    }

    /// Decode `[anchors, 4+nc]`-oriented data into source-frame detections.
    fn decode(
        &self,
        data: &[f32],
        num_anchors: usize,
        transposed: bool,
        input: &TensorInput,
    ) -> Vec<Detection> {
        let features = self.io.output_features;
        let scale_x = input.src_width as f32 / self.io.input_width as f32;
        let scale_y = input.src_height as f32 / self.io.input_height as f32;

        let at = |anchor: usize, feature: usize| -> f32 {
            if transposed {
                // layout [1, F, N]
                data[feature * num_anchors + anchor]
            } else {
                // layout [1, N, F]
                data[anchor * features + feature]
            }
        };

        let mut detections = Vec::new();
        for i in 0..num_anchors {
            let mut best_id = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for c in 0..self.io.num_classes {
                let score = at(i, 4 + c);
                if score > best_score {
                    best_id = c;
                    best_score = score;
                }
            }
            if !best_score.is_finite() || best_score < RAW_CONF_FLOOR {
                continue;
            }

            let cx = at(i, 0);
            let cy = at(i, 1);
            let w = at(i, 2);
            let h = at(i, 3);
            if !(cx.is_finite() && cy.is_finite() && w.is_finite() && h.is_finite())
                || w <= 0.0
                || h <= 0.0
            {
                continue;
            }

            // 还原到原始帧坐标
            let x = ((cx - w / 2.0) * scale_x).clamp(0.0, input.src_width as f32);
            let y = ((cy - h / 2.0) * scale_y).clamp(0.0, input.src_height as f32);
            let bw = (w * scale_x).min(input.src_width as f32 - x);
            let bh = (h * scale_y).min(input.src_height as f32 - y);

            detections.push(Detection::new(
                Bbox::new(x, y, bw, bh, best_id, best_score),
                input.frame_seq,
            ));
        }

        detections.sort_by(|a, b| b.confidence().partial_cmp(&a.confidence()).unwrap());
        if detections.len() > MAX_CANDIDATES {
            debug!(
                "frame #{}: {} candidates truncated to {}",
                input.frame_seq,
                detections.len(),
                MAX_CANDIDATES
            );
            detections.truncate(MAX_CANDIDATES);
        }
        detections
    }
}

impl InferenceBackend for OnnxDetector {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn input_size(&self) -> (u32, u32) {
        (self.io.input_width, self.io.input_height)
    }

    fn detect(&mut self, input: &TensorInput) -> Result<Vec<Detection>, InferenceError> {
        let start = Instant::now();

        let input_value = ort::value::Value::from_array(input.data.clone())
            .map_err(|e| InferenceError::Engine(format!("input tensor: {e}")))?;
        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|e| InferenceError::Engine(format!("session run: {e}")))?;

        let elapsed = start.elapsed();
        if elapsed > self.budget {
            // Result discarded: a frame that missed its budget is stale.
            return Err(InferenceError::Timeout {
                elapsed,
                budget: self.budget,
            });
        }

        let output = outputs
            .get("output0")
            .or_else(|| outputs.iter().next().map(|(_, value)| value))
            .ok_or_else(|| InferenceError::Engine("model produced no outputs".to_string()))?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Engine(format!("output tensor: {e}")))?;

        if shape.len() != 3 {
            return Err(InferenceError::Engine(format!(
                "unexpected output shape {shape:?}"
            )));
        }
        let features = self.io.output_features as i64;
        let (num_anchors, transposed) = if shape[1] == features {
            (shape[2] as usize, true)
        } else if shape[2] == features {
            (shape[1] as usize, false)
        } else {
            return Err(InferenceError::Engine(format!(
                "output shape {shape:?} does not match {features} features"
            )));
        };

        Ok(self.decode(data, num_anchors, transposed, input))
    }
}
