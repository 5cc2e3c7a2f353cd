use crate::detect::result::Detection;

/// Post-detection filter: confidence threshold, class allow-list and
/// optional non-maximum suppression.
///
/// Raising `min_confidence` never increases the number of survivors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionFilter {
    /// Detections without a confidence are not affected.
    pub min_confidence: Option<f32>,
    /// When set, unlabeled detections are dropped.
    pub classes: Option<Vec<String>>,
    pub nms_iou: Option<f32>,
}

impl DetectionFilter {
    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let kept: Vec<Detection> = detections
            .into_iter()
            .filter(|det| self.accepts(det))
            .collect();
        match self.nms_iou {
            Some(iou) => non_max_suppression(kept, iou),
            None => kept,
        }
    }

    fn accepts(&self, det: &Detection) -> bool {
        if let (Some(min), Some(confidence)) = (self.min_confidence, det.confidence) {
            if confidence < min {
                return false;
            }
        }
        if let Some(classes) = &self.classes {
            let Some(label) = det.label.as_deref() else {
                return false;
            };
            return classes.iter().any(|class| class.eq_ignore_ascii_case(label));
        }
        true
    }
}

/// Greedy NMS by descending confidence. A box is dropped when it overlaps an
/// already kept box by more than `iou_threshold`.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .unwrap_or(0.0)
            .partial_cmp(&a.confidence.unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept.iter().all(|k| k.iou(&det) <= iou_threshold) {
            kept.push(det);
        }
    }
    kept
}
