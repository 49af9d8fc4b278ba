#![allow(clippy::type_complexity)]
pub mod aggregate; // 检测聚合 (去抖动 + 事件输出)
pub mod backend; // 推理后端 (CPU / 加速器)
pub mod buffer; // 帧环形缓冲
pub mod config; // 配置参数
pub mod error; // 错误类型
pub mod input; // 热感视频输入
pub mod metrics; // 运行状态与计数器
pub mod pipeline; // 流水线控制器
pub mod preprocess; // 帧预处理

pub use crate::aggregate::{AggregatorConfig, DetectionAggregator, DetectionEvent, EventKind};
pub use crate::backend::{BackendKind, BackendPreference, InferenceBackend};
pub use crate::buffer::FrameRing;
pub use crate::config::PipelineConfig;
pub use crate::error::{CaptureError, InferenceError, PreprocessError};
pub use crate::input::{CameraProfile, FrameSource, ThermalFrame};
pub use crate::metrics::{HealthSnapshot, PipelineMetrics, PipelineState};
pub use crate::pipeline::Pipeline;
pub use crate::preprocess::{transform, ModelSpec, TensorInput};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Class labels used when the model ships without embedded names.
pub static DEFAULT_CLASS_NAMES: Lazy<Vec<String>> =
    Lazy::new(|| vec!["animal".to_string(), "person".to_string()]);

/// Greedy NMS over one frame's candidates. Boxes of different classes never
/// suppress each other; within a class the highest-confidence box wins.
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|d1, d2| d2.confidence().partial_cmp(&d1.confidence()).unwrap());

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class_id() != xs[index].class_id() {
                continue;
            }
            let iou = xs[prev_index].bbox.iou(&xs[index].bbox);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Utc::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

/// One detection candidate, in pixel coordinates of its source frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: Bbox,
    /// Sequence number of the frame this detection came from.
    pub frame_seq: u64,
}

impl Detection {
    pub fn new(bbox: Bbox, frame_seq: u64) -> Self {
        Self { bbox, frame_seq }
    }

    pub fn class_id(&self) -> usize {
        self.bbox.id()
    }

    pub fn confidence(&self) -> f32 {
        self.bbox.confidence()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Bbox {
    // a bounding box around an object
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = (self.xmin + self.width).min(another.xmin + another.width);
        let t = self.ymin.max(another.ymin);
        let b = (self.ymin + self.height).min(another.ymin + another.height);
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union(another);
        if union <= f32::EPSILON {
            return 0.0;
        }
        self.intersection_area(another) / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, id: usize, conf: f32) -> Detection {
        Detection::new(Bbox::new(x, y, w, h, id, conf), 0)
    }

    #[test]
    fn test_iou_identical() {
        let a = Bbox::new(0.0, 0.0, 10.0, 10.0, 0, 0.9);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = Bbox::new(0.0, 0.0, 10.0, 10.0, 0, 0.9);
        let b = Bbox::new(100.0, 100.0, 10.0, 10.0, 0, 0.9);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_nms_suppresses_same_class() {
        let mut xs = vec![
            det(0.0, 0.0, 10.0, 10.0, 0, 0.9),
            det(1.0, 1.0, 10.0, 10.0, 0, 0.7),
        ];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 1);
        assert_eq!(xs[0].confidence(), 0.9);
    }

    #[test]
    fn test_nms_keeps_other_classes() {
        let mut xs = vec![
            det(0.0, 0.0, 10.0, 10.0, 0, 0.9),
            det(1.0, 1.0, 10.0, 10.0, 1, 0.7),
        ];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 2);
    }

    #[test]
    fn test_nms_keeps_distant_same_class() {
        let mut xs = vec![
            det(0.0, 0.0, 10.0, 10.0, 0, 0.9),
            det(50.0, 50.0, 10.0, 10.0, 0, 0.7),
        ];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 2);
    }
}
