use anyhow::{anyhow, Result};
use serde_json::Value;

use super::result::{BoundingBox, Detection, DetectionFrame, TrackId};
use crate::Timestamp;

const FRAME_FIELDS: [&str; 2] = ["at_ms", "detections"];
const DETECTION_FIELDS: [&str; 4] = ["track_id", "bbox", "confidence", "class_id"];

fn ensure_allowed_fields(
    context: &str,
    obj: &serde_json::Map<String, Value>,
    allowed: &[&str],
) -> Result<()> {
    let extras: Vec<String> = obj
        .keys()
        .filter(|key| !allowed.contains(&key.as_str()))
        .cloned()
        .collect();
    if extras.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "{} contains unknown fields: {}",
        context,
        extras.join(", ")
    ))
}

fn parse_bbox(value: &Value) -> Result<BoundingBox> {
    let coords = value
        .as_array()
        .ok_or_else(|| anyhow!("detection.bbox must be an array [x1, y1, x2, y2]"))?;
    if coords.len() != 4 {
        return Err(anyhow!(
            "detection.bbox must have 4 coordinates, got {}",
            coords.len()
        ));
    }
    let mut out = [0f32; 4];
    for (slot, coord) in out.iter_mut().zip(coords) {
        *slot = coord
            .as_f64()
            .ok_or_else(|| anyhow!("detection.bbox coordinates must be numbers"))?
            as f32;
    }
    Ok(BoundingBox::new(out[0], out[1], out[2], out[3]))
}

fn parse_detection(value: &Value) -> Result<Detection> {
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("detection must be a JSON object"))?;
    ensure_allowed_fields("detection", obj, &DETECTION_FIELDS)?;

    let track_id = obj
        .get("track_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("detection.track_id must be a non-negative integer"))?;
    let bbox = obj
        .get("bbox")
        .ok_or_else(|| anyhow!("detection.bbox is required"))
        .and_then(parse_bbox)?;
    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("detection.confidence must be a number"))?
        as f32;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(anyhow!("detection.confidence must be within 0..=1"));
    }
    let class_id = match obj.get("class_id") {
        None | Some(Value::Null) => None,
        Some(raw) => {
            let class = raw
                .as_u64()
                .ok_or_else(|| anyhow!("detection.class_id must be a non-negative integer"))?;
            Some(
                u32::try_from(class)
                    .map_err(|_| anyhow!("detection.class_id out of range"))?,
            )
        }
    };

    Ok(Detection {
        track_id: TrackId::new(track_id),
        bbox,
        confidence,
        class_id,
    })
}

/// Parse one tracker output frame, rejecting any fields outside the intake schema.
pub fn parse_frame_payload(payload: &Value) -> Result<DetectionFrame> {
    let obj = payload
        .as_object()
        .ok_or_else(|| anyhow!("frame payload must be a JSON object"))?;
    ensure_allowed_fields("frame", obj, &FRAME_FIELDS)?;

    let at = match obj.get("at_ms") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(Timestamp::from_epoch_ms(
            raw.as_u64()
                .ok_or_else(|| anyhow!("frame.at_ms must be a non-negative integer"))?,
        )),
    };
    let detections = match obj.get("detections") {
        None | Some(Value::Null) => Vec::new(),
        Some(raw) => raw
            .as_array()
            .ok_or_else(|| anyhow!("frame.detections must be an array"))?
            .iter()
            .map(parse_detection)
            .collect::<Result<Vec<_>>>()?,
    };

    Ok(DetectionFrame { at, detections })
}
