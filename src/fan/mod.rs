pub mod convert;
pub mod error;
pub mod synchronizer;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;

pub use error::DeviceError;
pub use synchronizer::FanSynchronizer;

/// Raw device state keyed by DP id, as the device reports it.
pub type DataPointMap = serde_json::Map<String, serde_json::Value>;

/// DP ids of the fan firmware. These are fixed by the device, not configurable.
pub mod dp {
    pub const POWER: &str = "1";
    pub const SPEED: &str = "3";
    pub const DIRECTION: &str = "4";
    pub const LIGHT: &str = "9";
}

/// Declared step of the rotation speed characteristic (five levels above zero).
pub const SPEED_STEP: i64 = 20;

/// The four controllable characteristics exposed by the fan and its light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    FanOn,
    RotationDirection,
    RotationSpeed,
    LightOn,
}

impl Characteristic {
    pub const ALL: [Characteristic; 4] = [
        Characteristic::FanOn,
        Characteristic::RotationDirection,
        Characteristic::RotationSpeed,
        Characteristic::LightOn,
    ];

    /// DP id backing this characteristic.
    pub fn dp_id(self) -> &'static str {
        match self {
            Characteristic::FanOn => dp::POWER,
            Characteristic::RotationDirection => dp::DIRECTION,
            Characteristic::RotationSpeed => dp::SPEED,
            Characteristic::LightOn => dp::LIGHT,
        }
    }

    /// Name used on the characteristic surface (MQTT topic segment, config keys).
    pub fn as_str(self) -> &'static str {
        match self {
            Characteristic::FanOn => "on",
            Characteristic::RotationDirection => "rotation_direction",
            Characteristic::RotationSpeed => "rotation_speed",
            Characteristic::LightOn => "light_on",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Characteristic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Characteristic::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown characteristic '{s}'"))
    }
}

/// Semantic value of a characteristic as seen by controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicValue {
    Bool(bool),
    Int(i64),
}

impl CharacteristicValue {
    pub fn as_bool(self) -> bool {
        match self {
            CharacteristicValue::Bool(b) => b,
            CharacteristicValue::Int(n) => n != 0,
        }
    }

    pub fn as_int(self) -> i64 {
        match self {
            CharacteristicValue::Bool(b) => i64::from(b),
            CharacteristicValue::Int(n) => n,
        }
    }
}

impl fmt::Display for CharacteristicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharacteristicValue::Bool(b) => write!(f, "{b}"),
            CharacteristicValue::Int(n) => write!(f, "{n}"),
        }
    }
}

/// How a write is reflected in the local cache before the device confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Cache only changes when the device reports the new value.
    Reactive,
    /// Cache and surface change immediately; device reports overwrite the guess.
    #[default]
    Optimistic,
}

impl FromStr for WritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "optimistic" => Ok(WritePolicy::Optimistic),
            "reactive" => Ok(WritePolicy::Reactive),
            other => Err(format!("unknown write policy '{other}'")),
        }
    }
}

/// Write policy per characteristic: a default plus explicit overrides.
#[derive(Debug, Clone, Default)]
pub struct WritePolicies {
    pub default: WritePolicy,
    pub overrides: HashMap<Characteristic, WritePolicy>,
}

impl WritePolicies {
    pub fn uniform(policy: WritePolicy) -> Self {
        Self {
            default: policy,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, characteristic: Characteristic, policy: WritePolicy) -> Self {
        self.overrides.insert(characteristic, policy);
        self
    }

    pub fn for_characteristic(&self, characteristic: Characteristic) -> WritePolicy {
        self.overrides
            .get(&characteristic)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Static accessory descriptor published alongside the characteristics.
#[derive(Debug, Clone, Serialize)]
pub struct AccessoryInfo {
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub serial_number: &'static str,
    pub fan_service_name: &'static str,
    pub light_service_name: &'static str,
    pub rotation_speed_step: i64,
}

pub const ACCESSORY_INFO: AccessoryInfo = AccessoryInfo {
    manufacturer: "Brilliant Smart",
    model: "DC Ceiling Fan BAHAMA",
    serial_number: "20918",
    fan_service_name: "Ceiling Fan",
    light_service_name: "Ceiling Fan Light",
    rotation_speed_step: SPEED_STEP,
};

/// Events emitted by a device client.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    Error(String),
    /// Full snapshot, e.g. the answer to a query.
    Data(DataPointMap),
    /// Partial update pushed by the device.
    Refresh(DataPointMap),
}

/// Requests arriving from the characteristic surface.
#[derive(Debug)]
pub enum SurfaceRequest {
    Write {
        characteristic: Characteristic,
        value: CharacteristicValue,
    },
    Read {
        characteristic: Characteristic,
        reply: oneshot::Sender<Option<CharacteristicValue>>,
    },
}

/// Connection-oriented client for one physical device.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Locate the device on the local network.
    async fn discover(&self) -> Result<IpAddr, DeviceError>;

    /// Open a session. Connectivity changes are reported as [`DeviceEvent`]s.
    async fn connect(&self) -> Result<(), DeviceError>;

    /// Fetch the full current DP map.
    async fn query(&self) -> Result<DataPointMap, DeviceError>;

    /// Write a single DP.
    async fn set(&self, dp_id: &str, value: serde_json::Value) -> Result<(), DeviceError>;
}

/// Receiver of characteristic update notifications. Updates never re-enter
/// the write path.
pub trait CharacteristicSink: Send + Sync {
    fn update(&self, characteristic: Characteristic, value: CharacteristicValue);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn characteristic_names_round_trip() {
        for c in Characteristic::ALL {
            assert_eq!(c.as_str().parse::<Characteristic>(), Ok(c));
        }
        assert!("brightness".parse::<Characteristic>().is_err());
    }

    #[test]
    fn characteristics_map_to_firmware_dps() {
        assert_eq!(Characteristic::FanOn.dp_id(), "1");
        assert_eq!(Characteristic::RotationSpeed.dp_id(), "3");
        assert_eq!(Characteristic::RotationDirection.dp_id(), "4");
        assert_eq!(Characteristic::LightOn.dp_id(), "9");
    }

    #[test]
    fn policy_overrides_take_precedence() {
        let policies = WritePolicies::uniform(WritePolicy::Optimistic)
            .with_override(Characteristic::LightOn, WritePolicy::Reactive);
        assert_eq!(
            policies.for_characteristic(Characteristic::LightOn),
            WritePolicy::Reactive
        );
        assert_eq!(
            policies.for_characteristic(Characteristic::FanOn),
            WritePolicy::Optimistic
        );
    }

    #[test]
    fn policy_parsing_is_case_insensitive() {
        assert_eq!(" Reactive ".parse::<WritePolicy>(), Ok(WritePolicy::Reactive));
        assert_eq!("OPTIMISTIC".parse::<WritePolicy>(), Ok(WritePolicy::Optimistic));
        assert!("eager".parse::<WritePolicy>().is_err());
    }
}
