use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::net::IpAddr;
use std::time::Duration;

use crate::fan::{Characteristic, WritePolicies, WritePolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub tuya: TuyaConfig,
    pub sync: SyncConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct TuyaConfig {
    pub poll_interval_secs: u64,
    pub discovery_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub write_policies: WritePolicies,
    /// 0 disables the re-query of unconfirmed writes.
    pub confirm_timeout_secs: u64,
}

impl SyncConfig {
    pub fn confirm_timeout(&self) -> Option<Duration> {
        (self.confirm_timeout_secs > 0).then(|| Duration::from_secs(self.confirm_timeout_secs))
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub key: String,
    /// Known address; discovered from the device broadcast when absent.
    pub ip: Option<IpAddr>,
    pub name: String,
    /// Sanitized name for use in MQTT topics (lowercase, spaces to underscores)
    pub topic_name: String,
    pub version: String,
}

#[derive(Deserialize)]
struct RawDevice {
    id: String,
    key: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

fn env_required(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("{key} environment variable is required"))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let devices_file = env_or_default("DEVICES_FILE", "devices.json".to_string());
        let devices = load_devices(&devices_file)?;

        let default_policy = match env_optional("WRITE_POLICY") {
            Some(v) => v.parse::<WritePolicy>().map_err(|e| format!("WRITE_POLICY: {e}"))?,
            None => WritePolicy::default(),
        };
        let overrides = match env_optional("WRITE_POLICY_OVERRIDES") {
            Some(v) => {
                parse_policy_overrides(&v).map_err(|e| format!("WRITE_POLICY_OVERRIDES: {e}"))?
            }
            None => HashMap::new(),
        };

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required("MQTT_BROKER_HOST")?,
                broker_port: env_or_default("MQTT_BROKER_PORT", 1883),
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                topic_prefix: env_or_default("MQTT_TOPIC_PREFIX", "ceiling_fan".to_string()),
                client_id: env_or_default("MQTT_CLIENT_ID", "ceiling-fan-bridge".to_string()),
            },
            tuya: TuyaConfig {
                poll_interval_secs: env_or_default("TUYA_POLL_INTERVAL_SECS", 30),
                discovery_timeout_secs: env_or_default("TUYA_DISCOVERY_TIMEOUT_SECS", 10),
            },
            sync: SyncConfig {
                write_policies: WritePolicies {
                    default: default_policy,
                    overrides,
                },
                confirm_timeout_secs: env_or_default("CONFIRM_TIMEOUT_SECS", 10),
            },
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.devices.is_empty() {
            return Err("No devices found in devices file".into());
        }
        if self.tuya.poll_interval_secs == 0 {
            return Err("TUYA_POLL_INTERVAL_SECS must be > 0".into());
        }
        if self.tuya.discovery_timeout_secs == 0 {
            return Err("TUYA_DISCOVERY_TIMEOUT_SECS must be > 0".into());
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.topic_name.as_str()) {
                return Err(format!(
                    "Devices share the topic name '{}'; give them distinct names",
                    device.topic_name
                ));
            }
        }
        Ok(())
    }

    pub fn device_status_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/bridge_status", self.mqtt.topic_prefix, topic_name)
    }

    pub fn device_info_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/info", self.mqtt.topic_prefix, topic_name)
    }

    pub fn device_state_topic(&self, topic_name: &str, characteristic: Characteristic) -> String {
        format!(
            "{}/{}/state/{}",
            self.mqtt.topic_prefix, topic_name, characteristic
        )
    }

    /// Subscriptions for inbound writes and reads.
    pub fn device_request_topics(&self, topic_name: &str) -> [String; 2] {
        [
            format!("{}/{}/set/+", self.mqtt.topic_prefix, topic_name),
            format!("{}/{}/get/+", self.mqtt.topic_prefix, topic_name),
        ]
    }
}

fn load_devices(path: &str) -> Result<Vec<DeviceConfig>, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read {path}: {e}"))?;
    parse_devices(&content).map_err(|e| format!("Failed to parse {path}: {e}"))
}

fn parse_devices(content: &str) -> Result<Vec<DeviceConfig>, String> {
    let raw_devices: Vec<RawDevice> = serde_json::from_str(content).map_err(|e| e.to_string())?;

    raw_devices
        .into_iter()
        .map(|raw| {
            if raw.key.is_empty() {
                return Err(format!("Device {} has an empty 'key'", raw.id));
            }

            let ip = raw
                .ip
                .as_deref()
                .filter(|ip| !ip.is_empty())
                .map(|ip| {
                    ip.parse::<IpAddr>()
                        .map_err(|e| format!("Device {} invalid IP: {e}", raw.id))
                })
                .transpose()?;

            let name = raw.name.unwrap_or_else(|| raw.id.clone());
            let topic_name = sanitize_topic_name(&name);

            Ok(DeviceConfig {
                name,
                id: raw.id,
                key: raw.key,
                ip,
                topic_name,
                version: raw.version.unwrap_or_else(|| "3.3".to_string()),
            })
        })
        .collect()
}

/// Parse `characteristic=policy` pairs, e.g. `light_on=reactive,rotation_speed=optimistic`.
fn parse_policy_overrides(overrides: &str) -> Result<HashMap<Characteristic, WritePolicy>, String> {
    overrides
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| -> Result<(Characteristic, WritePolicy), String> {
            let (name, policy) = entry
                .split_once('=')
                .ok_or_else(|| format!("expected characteristic=policy, got '{entry}'"))?;
            Ok((name.trim().parse()?, policy.parse()?))
        })
        .collect()
}

/// Convert a device name into a safe MQTT topic segment.
/// "Bedroom Fan" → "bedroom_fan"
fn sanitize_topic_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}
