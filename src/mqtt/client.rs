use std::collections::HashMap;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::fan::ACCESSORY_INFO;

use super::CharacteristicUpdate;

pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    config: Config,
}

impl MqttClient {
    pub fn new(config: &Config) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(std::time::Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        // LWT: publish "offline" on disconnect. Use the fan's status topic for
        // single-device setups; generic bridge topic for multi-device.
        let lwt_topic = match config.devices.as_slice() {
            [device] => config.device_status_topic(&device.topic_name),
            _ => format!("{}/bridge_status", config.mqtt.topic_prefix),
        };
        let lwt = rumqttc::LastWill::new(
            lwt_topic,
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        mqttopts.set_last_will(lwt);

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            config: config.clone(),
        }
    }

    /// Run the MQTT event loop. Subscribes to set/get topics on connect,
    /// forwards incoming requests through request_tx, and publishes
    /// characteristic updates received from update_rx.
    pub async fn run(
        self,
        request_tx: mpsc::Sender<MqttMessage>,
        mut update_rx: mpsc::UnboundedReceiver<CharacteristicUpdate>,
    ) {
        let MqttClient {
            client,
            mut eventloop,
            config,
        } = self;
        let mut last_values: HashMap<String, String> = HashMap::new();

        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(event) => handle_event(&client, &config, &event, &request_tx).await,
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(update) = update_rx.recv() => {
                    let topic = config.device_state_topic(&update.topic_name, update.characteristic);
                    let value = update.value.to_string();
                    if !record_change(&mut last_values, &topic, &value) {
                        continue;
                    }

                    info!("Publishing {}: {}", topic, value);
                    if let Err(e) = client
                        .publish(&topic, QoS::AtMostOnce, true, value.as_bytes())
                        .await
                    {
                        warn!("Failed to publish {}: {}", topic, e);
                        continue;
                    }
                    // Drive the event loop to immediately flush this publish to the socket
                    match eventloop.poll().await {
                        Ok(event) => handle_event(&client, &config, &event, &request_tx).await,
                        Err(e) => error!("MQTT error after publish flush: {}", e),
                    }
                }
            }
        }
    }
}

/// Remember the last value published per state topic. Returns false when the
/// value is unchanged and the publish should be skipped. A `get` whose answer
/// did not change therefore publishes nothing: the retained state topic
/// already carries that value.
fn record_change(last_values: &mut HashMap<String, String>, topic: &str, value: &str) -> bool {
    if last_values.get(topic).map(String::as_str) == Some(value) {
        return false;
    }
    last_values.insert(topic.to_string(), value.to_string());
    true
}

async fn handle_event(
    client: &AsyncClient,
    config: &Config,
    event: &Event,
    request_tx: &mpsc::Sender<MqttMessage>,
) {
    let Event::Incoming(incoming) = event else {
        return;
    };

    match incoming {
        Incoming::ConnAck(_) => {
            info!("Connected to MQTT broker");
            announce_devices(client, config).await;
        }
        Incoming::Publish(publish) => {
            let msg = MqttMessage {
                topic: publish.topic.clone(),
                payload: String::from_utf8_lossy(&publish.payload).to_string(),
            };
            if request_tx.send(msg).await.is_err() {
                warn!("Request channel closed");
            }
        }
        _ => {}
    }
}

/// Mark every fan online, publish its accessory info and subscribe to its
/// request topics. Runs on every (re)connect.
async fn announce_devices(client: &AsyncClient, config: &Config) {
    let info = match serde_json::to_string(&ACCESSORY_INFO) {
        Ok(info) => info,
        Err(e) => {
            error!("Failed to encode accessory info: {}", e);
            return;
        }
    };

    for device in &config.devices {
        let status_topic = config.device_status_topic(&device.topic_name);
        if let Err(e) = client
            .publish(&status_topic, QoS::AtLeastOnce, true, "online")
            .await
        {
            error!("Failed to publish online status: {}", e);
        }

        let info_topic = config.device_info_topic(&device.topic_name);
        if let Err(e) = client
            .publish(&info_topic, QoS::AtLeastOnce, true, info.as_bytes())
            .await
        {
            error!("Failed to publish accessory info: {}", e);
        }

        for topic in config.device_request_topics(&device.topic_name) {
            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                error!("Failed to subscribe to {}: {}", topic, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_state_is_not_republished() {
        let mut last_values = HashMap::new();
        let topic = "ceiling_fan/fan/state/on";

        assert!(record_change(&mut last_values, topic, "true"));
        assert!(!record_change(&mut last_values, topic, "true"));
        assert!(record_change(&mut last_values, topic, "false"));
        assert!(record_change(&mut last_values, "ceiling_fan/fan/state/light_on", "false"));
    }
}
