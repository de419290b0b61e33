mod config;
mod fan;
mod mqtt;
mod tuya;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use fan::{Characteristic, DeviceEvent, FanSynchronizer, SurfaceRequest};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting ceiling-fan-bridge (mqtt={}:{}, devices={}, policy={:?}, confirm_timeout={}s)",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.devices.len(),
        config.sync.write_policies.default,
        config.sync.confirm_timeout_secs,
    );

    for device in &config.devices {
        match device.ip {
            Some(ip) => info!("  Device: {} ({}) at {}", device.name, device.id, ip),
            None => info!("  Device: {} ({}), address via discovery", device.name, device.id),
        }
    }

    // Channels
    let (mqtt_request_tx, mut mqtt_request_rx) = mpsc::channel::<mqtt::client::MqttMessage>(100);
    let (update_tx, update_rx) = mpsc::unbounded_channel::<mqtt::CharacteristicUpdate>();

    // Create MQTT client and spawn event loop (handles both MQTT I/O and state publishing)
    let mqtt_client = mqtt::client::MqttClient::new(&config);
    let mqtt_handle = tokio::spawn(async move {
        mqtt_client.run(mqtt_request_tx, update_rx).await;
    });

    // One broadcast listener shared by every fan without a configured address
    let discovery = tuya::discovery::Discovery::new();
    if config.devices.iter().any(|d| d.ip.is_none()) {
        discovery.listen();
    }

    // Per-device request channels, keyed by topic_name for routing
    let mut device_request_txs: HashMap<String, mpsc::Sender<SurfaceRequest>> = HashMap::new();
    let mut device_handles = Vec::new();

    for device_config in &config.devices {
        let (event_tx, event_rx) = mpsc::channel::<DeviceEvent>(100);
        let (request_tx, request_rx) = mpsc::channel::<SurfaceRequest>(50);
        device_request_txs.insert(device_config.topic_name.clone(), request_tx);

        let client = Arc::new(tuya::TuyaFanClient::new(
            device_config.clone(),
            &config.tuya,
            discovery.clone(),
            event_tx,
        ));
        let sink = Arc::new(mqtt::MqttSink::new(
            device_config.topic_name.clone(),
            update_tx.clone(),
        ));
        let synchronizer = FanSynchronizer::new(
            device_config.name.clone(),
            client,
            sink,
            config.sync.write_policies.clone(),
        )
        .with_confirm_timeout(config.sync.confirm_timeout());

        device_handles.push(tokio::spawn(synchronizer.run(event_rx, request_rx)));
    }

    // Only the sinks hold update senders from here on
    drop(update_tx);

    let topic_prefix = config.mqtt.topic_prefix.clone();

    // Main loop: route MQTT requests to synchronizers + handle shutdown
    loop {
        tokio::select! {
            Some(msg) = mqtt_request_rx.recv() => {
                let Some(route) = parse_request_topic(&msg.topic, &topic_prefix) else {
                    continue;
                };
                let Some(request_tx) = device_request_txs.get(route.topic_name) else {
                    warn!("Unknown device in request topic: {}", route.topic_name);
                    continue;
                };
                let Some(request) = build_request(&route, &msg.payload) else {
                    warn!("Could not build request: topic={}, payload={}", msg.topic, msg.payload);
                    continue;
                };
                if request_tx.send(request).await.is_err() {
                    warn!("Request channel closed for device {}", route.topic_name);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = async {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("Failed to register SIGTERM handler");
                sigterm.recv().await;
            } => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    for handle in device_handles {
        handle.abort();
    }
    mqtt_handle.abort();
    info!("ceiling-fan-bridge stopped");
}

#[derive(Debug, PartialEq)]
enum RequestKind {
    Set,
    Get,
}

#[derive(Debug, PartialEq)]
struct RequestRoute<'a> {
    topic_name: &'a str,
    kind: RequestKind,
    characteristic: Characteristic,
}

/// Parse a request topic.
/// Expected format: {prefix}/{topic_name}/{set|get}/{characteristic}
fn parse_request_topic<'a>(topic: &'a str, prefix: &str) -> Option<RequestRoute<'a>> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (topic_name, rest) = rest.split_once('/')?;
    let (kind, characteristic) = rest.split_once('/')?;
    if topic_name.is_empty() {
        return None;
    }
    let kind = match kind {
        "set" => RequestKind::Set,
        "get" => RequestKind::Get,
        _ => return None,
    };
    Some(RequestRoute {
        topic_name,
        kind,
        characteristic: characteristic.parse().ok()?,
    })
}

fn build_request(route: &RequestRoute<'_>, payload: &str) -> Option<SurfaceRequest> {
    match route.kind {
        RequestKind::Set => Some(SurfaceRequest::Write {
            characteristic: route.characteristic,
            value: mqtt::parse_payload(route.characteristic, payload)?,
        }),
        RequestKind::Get => {
            // The refreshed value reaches MQTT through the state topics.
            let (reply, _) = oneshot::channel();
            Some(SurfaceRequest::Read {
                characteristic: route.characteristic,
                reply,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fan::CharacteristicValue;

    #[test]
    fn parses_set_and_get_topics() {
        assert_eq!(
            parse_request_topic("ceiling_fan/bedroom_fan/set/rotation_speed", "ceiling_fan"),
            Some(RequestRoute {
                topic_name: "bedroom_fan",
                kind: RequestKind::Set,
                characteristic: Characteristic::RotationSpeed,
            })
        );
        assert_eq!(
            parse_request_topic("ceiling_fan/bedroom_fan/get/light_on", "ceiling_fan"),
            Some(RequestRoute {
                topic_name: "bedroom_fan",
                kind: RequestKind::Get,
                characteristic: Characteristic::LightOn,
            })
        );
    }

    #[test]
    fn rejects_foreign_and_malformed_topics() {
        assert_eq!(parse_request_topic("other/bedroom_fan/set/on", "ceiling_fan"), None);
        assert_eq!(parse_request_topic("ceiling_fan/bedroom_fan/state/on", "ceiling_fan"), None);
        assert_eq!(parse_request_topic("ceiling_fan//set/on", "ceiling_fan"), None);
        assert_eq!(parse_request_topic("ceiling_fan/bedroom_fan/set/dimmer", "ceiling_fan"), None);
        assert_eq!(parse_request_topic("ceiling_fan/bedroom_fan/set", "ceiling_fan"), None);
    }

    #[test]
    fn builds_write_requests_from_payloads() {
        let route = parse_request_topic("ceiling_fan/fan/set/on", "ceiling_fan").unwrap();
        match build_request(&route, "true") {
            Some(SurfaceRequest::Write {
                characteristic,
                value,
            }) => {
                assert_eq!(characteristic, Characteristic::FanOn);
                assert_eq!(value, CharacteristicValue::Bool(true));
            }
            other => panic!("unexpected request: {other:?}"),
        }
        assert!(build_request(&route, "sometimes").is_none());
    }

    #[test]
    fn get_requests_ignore_payload() {
        let route = parse_request_topic("ceiling_fan/fan/get/rotation_direction", "ceiling_fan").unwrap();
        assert!(matches!(
            build_request(&route, ""),
            Some(SurfaceRequest::Read {
                characteristic: Characteristic::RotationDirection,
                ..
            })
        ));
    }
}
