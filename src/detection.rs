use crate::{frame::MediaKind, quality::QualityReport};
use serde::{Deserialize, Serialize};

/// One recognized object, in frame pixel coordinates with a top-left origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub class_id: u32,
    pub label: String,
    pub confidence: f32,
}

impl Detection {
    fn x2(&self) -> f32 {
        self.x + self.width
    }

    fn y2(&self) -> f32 {
        self.y + self.height
    }

    fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let union = self.area() + other.area() - intersection(self, other);
        if union <= 0.0 {
            return 0.0;
        }
        intersection(self, other) / union
    }
}

fn intersection(box1: &Detection, box2: &Detection) -> f32 {
    let width = box1.x2().min(box2.x2()) - box1.x.max(box2.x);
    let height = box1.y2().min(box2.y2()) - box1.y.max(box2.y);
    width.max(0.0) * height.max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

/// Collapses same-class boxes overlapping above `iou_threshold` onto the most
/// confident one. The sort is stable, so on equal confidence the earlier box wins.
pub fn non_max_suppression(mut boxes: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept.iter().any(|winner| {
            winner.class_id == candidate.class_id && winner.iou(&candidate) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    pub frame_index: usize,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub request_id: String,
    pub kind: MediaKind,
    pub model: String,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
    pub frames: Vec<FrameResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, size: f32, class_id: u32, confidence: f32) -> Detection {
        Detection {
            x,
            y,
            width: size,
            height: size,
            class_id,
            label: format!("class_{}", class_id),
            confidence,
        }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0.0, 0.0, 10.0, 0, 0.9);
        let b = bbox(5.0, 0.0, 10.0, 0, 0.9);
        let c = bbox(50.0, 50.0, 10.0, 0, 0.9);

        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn test_nms_drops_lower_confidence_overlap() {
        let boxes = vec![
            bbox(0.0, 0.0, 100.0, 1, 0.6),
            bbox(2.0, 2.0, 100.0, 1, 0.9),
        ];
        let kept = non_max_suppression(boxes, 0.5);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[0].x, 2.0);
    }

    #[test]
    fn test_nms_tie_keeps_first_submitted() {
        let boxes = vec![
            bbox(0.0, 0.0, 100.0, 1, 0.8),
            bbox(1.0, 1.0, 100.0, 1, 0.8),
        ];
        let kept = non_max_suppression(boxes, 0.5);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].x, 0.0);
    }

    #[test]
    fn test_nms_keeps_other_classes() {
        let boxes = vec![
            bbox(0.0, 0.0, 100.0, 1, 0.9),
            bbox(0.0, 0.0, 100.0, 2, 0.8),
        ];
        let kept = non_max_suppression(boxes, 0.5);

        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_nms_keeps_boxes_under_threshold() {
        let boxes = vec![
            bbox(0.0, 0.0, 10.0, 1, 0.9),
            bbox(8.0, 8.0, 10.0, 1, 0.7),
        ];
        let kept = non_max_suppression(boxes, 0.5);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }
}
