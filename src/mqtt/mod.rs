pub mod client;

use tokio::sync::mpsc;
use tracing::warn;

use crate::fan::{Characteristic, CharacteristicSink, CharacteristicValue};

/// A characteristic change for one fan, ready to publish to MQTT.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicUpdate {
    pub topic_name: String,
    pub characteristic: Characteristic,
    pub value: CharacteristicValue,
}

/// Characteristic surface of one fan, backed by the MQTT publisher task.
pub struct MqttSink {
    topic_name: String,
    updates: mpsc::UnboundedSender<CharacteristicUpdate>,
}

impl MqttSink {
    pub fn new(topic_name: String, updates: mpsc::UnboundedSender<CharacteristicUpdate>) -> Self {
        Self {
            topic_name,
            updates,
        }
    }
}

impl CharacteristicSink for MqttSink {
    fn update(&self, characteristic: Characteristic, value: CharacteristicValue) {
        let update = CharacteristicUpdate {
            topic_name: self.topic_name.clone(),
            characteristic,
            value,
        };
        if self.updates.send(update).is_err() {
            warn!("Characteristic update channel closed");
        }
    }
}

/// Parse an inbound `set` payload for a characteristic.
pub fn parse_payload(characteristic: Characteristic, payload: &str) -> Option<CharacteristicValue> {
    let payload = payload.trim();
    match characteristic {
        Characteristic::FanOn | Characteristic::LightOn => {
            match payload.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Some(CharacteristicValue::Bool(true)),
                "false" | "0" | "off" => Some(CharacteristicValue::Bool(false)),
                _ => None,
            }
        }
        Characteristic::RotationDirection | Characteristic::RotationSpeed => payload
            .parse::<i64>()
            .ok()
            .or_else(|| payload.parse::<f64>().ok().map(|f| f.round() as i64))
            .map(CharacteristicValue::Int),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_boolean_payloads() {
        assert_eq!(
            parse_payload(Characteristic::FanOn, "ON"),
            Some(CharacteristicValue::Bool(true))
        );
        assert_eq!(
            parse_payload(Characteristic::LightOn, " 0 "),
            Some(CharacteristicValue::Bool(false))
        );
        assert_eq!(parse_payload(Characteristic::LightOn, "maybe"), None);
    }

    #[test]
    fn parses_numeric_payloads() {
        assert_eq!(
            parse_payload(Characteristic::RotationSpeed, "60"),
            Some(CharacteristicValue::Int(60))
        );
        assert_eq!(
            parse_payload(Characteristic::RotationSpeed, "39.6"),
            Some(CharacteristicValue::Int(40))
        );
        assert_eq!(parse_payload(Characteristic::RotationDirection, "left"), None);
    }

    #[test]
    fn sink_tags_updates_with_device_topic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = MqttSink::new("bedroom_fan".to_string(), tx);

        sink.update(Characteristic::LightOn, CharacteristicValue::Bool(true));

        assert_eq!(
            rx.try_recv().unwrap(),
            CharacteristicUpdate {
                topic_name: "bedroom_fan".to_string(),
                characteristic: Characteristic::LightOn,
                value: CharacteristicValue::Bool(true),
            }
        );
    }
}
