use super::result::Detection;

/// Person class index in the COCO label set used by the reference detector.
pub const PERSON_CLASS_ID: u32 = 0;

/// Post-tracker clean-up applied before detections reach the aggregator.
///
/// Keeps the class of interest above a confidence floor and drops boxes that
/// duplicate a higher-confidence box of another track (IoU above threshold).
#[derive(Clone, Debug)]
pub struct DetectionFilter {
    pub min_confidence: f32,
    pub iou_threshold: f32,
    pub class_id: u32,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            min_confidence: 0.35,
            iou_threshold: 0.45,
            class_id: PERSON_CLASS_ID,
        }
    }
}

impl DetectionFilter {
    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let mut candidates: Vec<Detection> = detections
            .into_iter()
            .filter(|det| det.confidence >= self.min_confidence)
            .filter(|det| det.class_id.map_or(true, |class| class == self.class_id))
            .collect();
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
        for det in candidates {
            let duplicate = kept.iter().any(|other| {
                other.track_id != det.track_id && other.bbox.iou(&det.bbox) > self.iou_threshold
            });
            if duplicate {
                log::debug!(
                    "suppressed {} (conf={:.2}): overlaps a stronger track",
                    det.track_id,
                    det.confidence
                );
                continue;
            }
            kept.push(det);
        }
        kept
    }
}
