mod filter;
mod payload;
mod result;
mod source;

pub use filter::{DetectionFilter, PERSON_CLASS_ID};
pub use payload::parse_frame_payload;
pub use result::{BoundingBox, Detection, DetectionFrame, TrackId};
pub use source::{DetectionSource, FramePoll, JsonLinesSource, ThreadedSource};
