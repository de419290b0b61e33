//! Translation between raw DP values and semantic characteristic values.
//!
//! Direction is lossy: every raw value other than `"forward"` reads as 0 and
//! writes back as `"reverse"`, so an unrecognized raw string does not survive
//! a raw → semantic → raw round trip.

use serde_json::{Value, json};

use super::{Characteristic, CharacteristicValue, DataPointMap, SPEED_STEP};

const FORWARD: &str = "forward";
const REVERSE: &str = "reverse";

/// Convert a semantic write into the raw DP value sent to the device.
pub fn to_raw(characteristic: Characteristic, value: CharacteristicValue) -> Value {
    match characteristic {
        Characteristic::FanOn | Characteristic::LightOn => json!(value.as_bool()),
        Characteristic::RotationDirection => json!(direction_to_raw(value.as_int())),
        Characteristic::RotationSpeed => json!(speed_to_raw(value.as_int())),
    }
}

/// Derive the semantic value of a characteristic from the cache.
/// `None` means the backing DP is absent or unreadable.
pub fn from_cache(characteristic: Characteristic, cache: &DataPointMap) -> Option<CharacteristicValue> {
    let raw = cache.get(characteristic.dp_id());
    match characteristic {
        Characteristic::FanOn | Characteristic::LightOn => {
            raw.and_then(bool_from_raw).map(CharacteristicValue::Bool)
        }
        Characteristic::RotationDirection => {
            Some(CharacteristicValue::Int(direction_from_raw(raw)))
        }
        Characteristic::RotationSpeed => {
            raw.and_then(speed_from_raw).map(CharacteristicValue::Int)
        }
    }
}

pub fn direction_to_raw(semantic: i64) -> &'static str {
    if semantic == 1 { FORWARD } else { REVERSE }
}

pub fn direction_from_raw(raw: Option<&Value>) -> i64 {
    match raw.and_then(Value::as_str) {
        Some(FORWARD) => 1,
        _ => 0,
    }
}

/// Quantize to the declared step, clamp to 0..=100 and scale to device units.
pub fn speed_to_raw(semantic: i64) -> String {
    let clamped = semantic.clamp(0, 5 * SPEED_STEP);
    let steps = (clamped + SPEED_STEP / 2) / SPEED_STEP;
    steps.to_string()
}

/// Device units × 20. Accepts both numeric strings and JSON numbers.
pub fn speed_from_raw(raw: &Value) -> Option<i64> {
    let units = match raw {
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    if !units.is_finite() {
        return None;
    }
    Some((units * SPEED_STEP as f64).round() as i64)
}

fn bool_from_raw(raw: &Value) -> Option<bool> {
    match raw {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.as_str() {
            "true" | "1" | "on" => Some(true),
            "false" | "0" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
