//! 检测聚合器 (Detection aggregator)
//!
//! Turns per-frame raw candidates into stable events: confidence threshold,
//! per-class NMS, then K/M debouncing so a single noisy frame neither raises
//! nor clears an alert. Event emission is this component's only side effect.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{non_max_suppression, Bbox, Detection};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Confidence threshold θ.
    pub conf_threshold: f32,
    /// NMS IoU threshold τ.
    pub iou_threshold: f32,
    /// Consecutive qualifying frames before a class is raised (K).
    pub promote_frames: u32,
    /// Consecutive absent frames before a raised class clears (M).
    pub release_frames: u32,
    pub class_names: Vec<String>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.5,
            iou_threshold: 0.45,
            promote_frames: 3,
            release_frames: 6,
            class_names: crate::DEFAULT_CLASS_NAMES.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Class confirmed present for K consecutive frames.
    Raised,
    /// Class absent for M consecutive frames after being raised.
    Cleared,
}

/// Stable, debounced detection event; the only data this core emits outward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub kind: EventKind,
    pub emitted_at: DateTime<Utc>,
    pub class_id: usize,
    pub label: String,
    /// Best box at emission time (last known box for `Cleared`).
    pub bbox: Bbox,
    pub confidence: f32,
    /// Frame that triggered the emission.
    pub frame_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    Idle,
    Tracking,
}

#[derive(Debug, Clone)]
struct ClassTrack {
    state: TrackState,
    hits: u32,
    misses: u32,
    last_bbox: Bbox,
}

/// Per-stream state machine. One instance per camera; callers feed processed
/// frames in order and forward the returned events to the sink.
pub struct DetectionAggregator {
    cfg: AggregatorConfig,
    tracks: BTreeMap<usize, ClassTrack>,
    last_seq: u64,
    stale_frames: u64,
}

impl DetectionAggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self {
            cfg,
            tracks: BTreeMap::new(),
            last_seq: 0,
            stale_frames: 0,
        }
    }

    /// Frames observed with a non-increasing sequence number (reordered under
    /// multi-worker operation) and ignored.
    pub fn stale_frames(&self) -> u64 {
        self.stale_frames
    }

    fn label(&self, class_id: usize) -> String {
        self.cfg
            .class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{class_id}"))
    }

    /// Feed one processed frame's raw candidates; returns the events (if any)
    /// this frame triggered.
    pub fn observe(
        &mut self,
        frame_seq: u64,
        captured_at: DateTime<Utc>,
        mut detections: Vec<Detection>,
    ) -> Vec<DetectionEvent> {
        if frame_seq <= self.last_seq {
            self.stale_frames += 1;
            debug!("ignoring stale frame #{frame_seq} (last #{})", self.last_seq);
            return Vec::new();
        }
        self.last_seq = frame_seq;

        // 1. 置信度过滤 θ
        detections.retain(|d| d.confidence() >= self.cfg.conf_threshold);
        // 2. 同类别框合并 (NMS τ)
        non_max_suppression(&mut detections, self.cfg.iou_threshold);

        // Best surviving box per class; detections are confidence-sorted after
        // NMS so the first hit per class wins.
        let mut present: BTreeMap<usize, Bbox> = BTreeMap::new();
        for d in &detections {
            present.entry(d.class_id()).or_insert_with(|| d.bbox.clone());
        }

        let mut events = Vec::new();

        // 3. 出现的类别: 连击计数, 达到K则触发
        for (&class_id, bbox) in &present {
            let label = self.label(class_id);
            let track = self.tracks.entry(class_id).or_insert_with(|| ClassTrack {
                state: TrackState::Idle,
                hits: 0,
                misses: 0,
                last_bbox: bbox.clone(),
            });
            track.hits = track.hits.saturating_add(1);
            track.misses = 0;
            track.last_bbox = bbox.clone();

            if track.state == TrackState::Idle && track.hits >= self.cfg.promote_frames {
                track.state = TrackState::Tracking;
                events.push(DetectionEvent {
                    kind: EventKind::Raised,
                    emitted_at: captured_at,
                    class_id,
                    label,
                    bbox: bbox.clone(),
                    confidence: bbox.confidence(),
                    frame_seq,
                });
            }
        }

        // 4. 缺席的类别: 丢失计数, 达到M则解除
        let mut newly_cleared = Vec::new();
        let mut expired_idle = Vec::new();
        for (&class_id, track) in self.tracks.iter_mut() {
            if present.contains_key(&class_id) {
                continue;
            }
            track.hits = 0;
            track.misses = track.misses.saturating_add(1);
            if track.misses < self.cfg.release_frames {
                continue;
            }
            match track.state {
                TrackState::Tracking => {
                    track.state = TrackState::Idle;
                    newly_cleared.push((class_id, track.last_bbox.clone()));
                }
                // Long-absent idle entries are dead state.
                TrackState::Idle => expired_idle.push(class_id),
            }
        }
        for (class_id, bbox) in newly_cleared {
            let confidence = bbox.confidence();
            events.push(DetectionEvent {
                kind: EventKind::Cleared,
                emitted_at: captured_at,
                class_id,
                label: self.label(class_id),
                bbox,
                confidence,
                frame_seq,
            });
        }
        for class_id in expired_idle {
            self.tracks.remove(&class_id);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: usize, conf: f32, seq: u64) -> Detection {
        Detection::new(Bbox::new(10.0, 10.0, 40.0, 40.0, class_id, conf), seq)
    }

    fn cfg(k: u32, m: u32) -> AggregatorConfig {
        AggregatorConfig {
            conf_threshold: 0.5,
            iou_threshold: 0.45,
            promote_frames: k,
            release_frames: m,
            class_names: vec!["animal".to_string(), "person".to_string()],
        }
    }

    /// Detection qualifies in frames 3..=9 with K=3 and M=2: raised at
    /// frame 5, cleared after frame 11.
    #[test]
    fn test_debounce_scenario() {
        let mut agg = DetectionAggregator::new(cfg(3, 2));
        let mut raised_at = None;
        let mut cleared_at = None;

        for seq in 1..=13u64 {
            let dets = if (3..=9).contains(&seq) {
                vec![det(0, 0.8, seq)]
            } else {
                vec![]
            };
            for event in agg.observe(seq, Utc::now(), dets) {
                match event.kind {
                    EventKind::Raised => raised_at = Some(event.frame_seq),
                    EventKind::Cleared => cleared_at = Some(event.frame_seq),
                }
            }
        }

        assert_eq!(raised_at, Some(5));
        assert_eq!(cleared_at, Some(11));
    }

    #[test]
    fn test_single_frame_noise_never_raises() {
        let mut agg = DetectionAggregator::new(cfg(3, 2));
        assert!(agg.observe(1, Utc::now(), vec![det(0, 0.9, 1)]).is_empty());
        assert!(agg.observe(2, Utc::now(), vec![]).is_empty());
        assert!(agg.observe(3, Utc::now(), vec![det(0, 0.9, 3)]).is_empty());
        assert!(agg.observe(4, Utc::now(), vec![]).is_empty());
    }

    #[test]
    fn test_gap_resets_consecutive_count() {
        let mut agg = DetectionAggregator::new(cfg(3, 5));
        assert!(agg.observe(1, Utc::now(), vec![det(0, 0.9, 1)]).is_empty());
        assert!(agg.observe(2, Utc::now(), vec![det(0, 0.9, 2)]).is_empty());
        assert!(agg.observe(3, Utc::now(), vec![]).is_empty()); // streak broken
        assert!(agg.observe(4, Utc::now(), vec![det(0, 0.9, 4)]).is_empty());
        assert!(agg.observe(5, Utc::now(), vec![det(0, 0.9, 5)]).is_empty());
        let events = agg.observe(6, Utc::now(), vec![det(0, 0.9, 6)]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Raised);
    }

    #[test]
    fn test_below_threshold_does_not_qualify() {
        let mut agg = DetectionAggregator::new(cfg(2, 2));
        assert!(agg.observe(1, Utc::now(), vec![det(0, 0.3, 1)]).is_empty());
        assert!(agg.observe(2, Utc::now(), vec![det(0, 0.3, 2)]).is_empty());
        assert!(agg.observe(3, Utc::now(), vec![det(0, 0.3, 3)]).is_empty());
    }

    #[test]
    fn test_overlapping_boxes_merge_to_best() {
        let mut agg = DetectionAggregator::new(cfg(1, 2));
        let dets = vec![
            Detection::new(Bbox::new(10.0, 10.0, 40.0, 40.0, 0, 0.9), 1),
            Detection::new(Bbox::new(12.0, 12.0, 40.0, 40.0, 0, 0.6), 1),
        ];
        let events = agg.observe(1, Utc::now(), dets);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].confidence, 0.9);
    }

    #[test]
    fn test_classes_tracked_independently() {
        let mut agg = DetectionAggregator::new(cfg(2, 2));
        agg.observe(1, Utc::now(), vec![det(0, 0.9, 1), det(1, 0.9, 1)]);
        let events = agg.observe(2, Utc::now(), vec![det(0, 0.9, 2), det(1, 0.9, 2)]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].label, "animal");
        assert_eq!(events[1].label, "person");
    }

    #[test]
    fn test_stale_frames_ignored() {
        let mut agg = DetectionAggregator::new(cfg(1, 1));
        agg.observe(5, Utc::now(), vec![]);
        let events = agg.observe(3, Utc::now(), vec![det(0, 0.9, 3)]);
        assert!(events.is_empty());
        assert_eq!(agg.stale_frames(), 1);
    }

    #[test]
    fn test_no_duplicate_raise_while_tracking() {
        let mut agg = DetectionAggregator::new(cfg(2, 2));
        let mut raised = 0;
        for seq in 1..=10u64 {
            for event in agg.observe(seq, Utc::now(), vec![det(0, 0.9, seq)]) {
                if event.kind == EventKind::Raised {
                    raised += 1;
                }
            }
        }
        assert_eq!(raised, 1);
    }
}
