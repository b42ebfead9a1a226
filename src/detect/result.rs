use serde::{Deserialize, Serialize};

/// Tracker-assigned identity of a detected subject.
///
/// Identifiers are reused by the tracker once a subject leaves the scene, so
/// they carry no ordering or range meaning. Only equality and hashing are
/// exposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(u64);

impl TrackId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ID {}", self.0)
    }
}

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left, `(x2, y2)` bottom-right.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Intersection over union; zero for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// One tracked detection from the external detector/tracker.
///
/// Ephemeral: consumed by the tick that receives it and never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Detector class index; `None` when the producer already filtered by class.
    pub class_id: Option<u32>,
}

/// All detections the tracker reported for one processed frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionFrame {
    /// Capture time; `None` means "stamp on arrival".
    pub at: Option<crate::Timestamp>,
    pub detections: Vec<Detection>,
}
