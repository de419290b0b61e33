use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_async_tuyapi::mesparse::{CommandType, Message};
use rust_async_tuyapi::tuyadevice::TuyaDevice;
use rust_async_tuyapi::{Payload, PayloadStruct};
use serde_json::json;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info};

use crate::config::{DeviceConfig, TuyaConfig};
use crate::fan::{DataPointMap, DeviceClient, DeviceError, DeviceEvent};

use super::discovery::Discovery;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Tuya local-protocol client for one fan. Once connected, a background task
/// keeps the session alive, polls, forwards DP messages as [`DeviceEvent`]s and
/// reconnects with backoff when the session drops.
pub struct TuyaFanClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: DeviceConfig,
    poll_interval: Duration,
    discovery_timeout: Duration,
    discovery: Arc<Discovery>,
    events: mpsc::Sender<DeviceEvent>,
    device: Mutex<Option<TuyaDevice>>,
    location: Mutex<Option<IpAddr>>,
    /// Callers of `query` waiting for the next DP query response.
    waiting: Mutex<Vec<oneshot::Sender<DataPointMap>>>,
}

impl TuyaFanClient {
    pub fn new(
        config: DeviceConfig,
        tuya: &TuyaConfig,
        discovery: Arc<Discovery>,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                location: Mutex::new(config.ip),
                config,
                poll_interval: Duration::from_secs(tuya.poll_interval_secs),
                discovery_timeout: Duration::from_secs(tuya.discovery_timeout_secs),
                discovery,
                events,
                device: Mutex::new(None),
                waiting: Mutex::new(Vec::new()),
            }),
        }
    }
}

#[async_trait]
impl DeviceClient for TuyaFanClient {
    async fn discover(&self) -> Result<IpAddr, DeviceError> {
        if let Some(ip) = self.inner.config.ip {
            return Ok(ip);
        }

        info!(
            "Listening for broadcast from {} ({})",
            self.inner.config.name, self.inner.config.id
        );
        let ip = self
            .inner
            .discovery
            .find(&self.inner.config.id, self.inner.discovery_timeout)
            .await?;
        *self.inner.location.lock().await = Some(ip);
        Ok(ip)
    }

    async fn connect(&self) -> Result<(), DeviceError> {
        let ip = self
            .inner
            .location
            .lock()
            .await
            .ok_or_else(|| DeviceError::Connect("device address unknown".into()))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(supervise(self.inner.clone(), ip, ready_tx));

        ready_rx
            .await
            .map_err(|_| DeviceError::Connect("session task ended".into()))?
    }

    async fn query(&self) -> Result<DataPointMap, DeviceError> {
        let (tx, rx) = oneshot::channel();
        // Register first so a fast response cannot slip past.
        self.inner.waiting.lock().await.push(tx);
        if let Err(e) = self.inner.send_query().await {
            drop(rx);
            self.inner.forget_abandoned_waiters().await;
            return Err(DeviceError::Query(e));
        }

        let answer = tokio::time::timeout(QUERY_TIMEOUT, rx).await;
        if answer.is_err() {
            // The receiver went down with the timeout.
            self.inner.forget_abandoned_waiters().await;
        }
        answer
            .map_err(|_| DeviceError::Timeout("DP query response"))?
            .map_err(|_| DeviceError::Query("session closed".into()))
    }

    async fn set(&self, dp_id: &str, value: serde_json::Value) -> Result<(), DeviceError> {
        let mut dps = serde_json::Map::new();
        dps.insert(dp_id.to_string(), value);
        let dps = serde_json::Value::Object(dps);

        info!("Sending command to {}: {}", self.inner.config.name, dps);

        let mut guard = self.inner.device.lock().await;
        let device = guard.as_mut().ok_or(DeviceError::NotConnected)?;
        device
            .set_values(dps)
            .await
            .map_err(|e| DeviceError::Set(format!("{e:?}")))?;
        Ok(())
    }
}

/// Session loop. Reports the outcome of the first connection attempt through
/// `ready`; later drops are retried with exponential backoff.
async fn supervise(inner: Arc<Inner>, ip: IpAddr, ready: oneshot::Sender<Result<(), DeviceError>>) {
    let mut ready = Some(ready);
    let mut backoff = MIN_BACKOFF;
    let name = inner.config.name.clone();

    loop {
        info!("Connecting to device {} ({}) at {}", name, inner.config.id, ip);

        let opened = async {
            let mut device = TuyaDevice::new(
                &inner.config.version,
                &inner.config.id,
                Some(&inner.config.key),
                ip,
            )
            .map_err(|e| format!("Failed to create device: {e:?}"))?;
            let receiver = device
                .connect()
                .await
                .map_err(|e| format!("Failed to connect: {e:?}"))?;
            Ok::<_, String>((device, receiver))
        }
        .await;

        let mut receiver = match opened {
            Ok((device, receiver)) => {
                *inner.device.lock().await = Some(device);
                receiver
            }
            Err(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(DeviceError::Connect(e)));
                    return;
                }
                error!("Device {} reconnect failed: {}. Retrying in {:?}", name, e, backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        info!("Connected to device {}", name);
        backoff = MIN_BACKOFF;
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }
        if !inner.emit(DeviceEvent::Connected).await {
            return;
        }

        let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut poll_timer = tokio::time::interval(inner.poll_interval);
        // Skip first tick (the synchronizer queries on connect)
        poll_timer.tick().await;

        let reason = loop {
            tokio::select! {
                _ = heartbeat_interval.tick() => {
                    if let Err(e) = inner.heartbeat().await {
                        break e;
                    }
                }
                _ = poll_timer.tick() => {
                    if let Err(e) = inner.send_query().await {
                        break e;
                    }
                }
                msg = receiver.recv() => match msg {
                    Some(Ok(messages)) => {
                        for m in messages {
                            if m.command == Some(CommandType::HeartBeat) {
                                continue;
                            }
                            if !inner.dispatch(&m).await {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => break format!("Device error: {e:?}"),
                    None => break "Device channel closed".to_string(),
                },
            }
        };

        error!(
            "Device {} session error: {}. Reconnecting in {:?}",
            name, reason, backoff
        );
        inner.device.lock().await.take();
        // Dropping the senders fails any query still waiting on this session.
        inner.waiting.lock().await.clear();

        if !inner.emit(DeviceEvent::Error(reason)).await
            || !inner.emit(DeviceEvent::Disconnected).await
        {
            return;
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

impl Inner {
    /// Returns false once nobody listens for events any more.
    async fn emit(&self, event: DeviceEvent) -> bool {
        if self.events.send(event).await.is_err() {
            debug!("Event channel closed, stopping session for {}", self.config.name);
            return false;
        }
        true
    }

    async fn heartbeat(&self) -> Result<(), String> {
        let mut guard = self.device.lock().await;
        let device = guard.as_mut().ok_or("Device not connected")?;
        device
            .heartbeat()
            .await
            .map_err(|e| format!("Heartbeat failed: {e:?}"))?;
        Ok(())
    }

    async fn send_query(&self) -> Result<(), String> {
        let payload = Payload::Struct(PayloadStruct {
            dev_id: self.config.id.clone(),
            gw_id: Some(self.config.id.clone()),
            uid: None,
            t: None,
            dp_id: None,
            dps: Some(json!({})),
        });

        let mut guard = self.device.lock().await;
        let device = guard.as_mut().ok_or("Device not connected")?;
        device
            .get(payload)
            .await
            .map_err(|e| format!("DP query failed: {e:?}"))
    }

    async fn forget_abandoned_waiters(&self) {
        self.waiting.lock().await.retain(|waiter| !waiter.is_closed());
    }

    /// Hand a query response to every pending `query` caller. Returns true if
    /// at least one of them took it.
    async fn answer_waiters(&self, points: &DataPointMap) -> bool {
        let mut answered = false;
        for waiter in self.waiting.lock().await.drain(..) {
            answered |= waiter.send(points.clone()).is_ok();
        }
        answered
    }

    /// Query responses become full snapshots, anything else a partial refresh.
    /// A response some `query` caller received is reconciled by that caller,
    /// so it is not emitted again.
    async fn dispatch(&self, msg: &Message) -> bool {
        let Some(points) = extract_dps(&msg.payload) else {
            debug!("No dps in message, skipping");
            return true;
        };

        if msg.command == Some(CommandType::DpQuery) {
            if self.answer_waiters(&points).await {
                return true;
            }
            self.emit(DeviceEvent::Data(points)).await
        } else {
            self.emit(DeviceEvent::Refresh(points)).await
        }
    }
}

/// Extract the dps object from whichever payload variant the library returns.
/// Query responses sometimes arrive as `Payload::String` holding JSON like
/// `{"dps":{"1":true,"3":"2"}}` instead of `Payload::Struct`.
fn extract_dps(payload: &Payload) -> Option<DataPointMap> {
    let dps = match payload {
        Payload::Struct(ps) => {
            debug!("PayloadStruct: dev_id={}, dps={:?}", ps.dev_id, ps.dps);
            ps.dps.clone()
        }
        Payload::String(s) => {
            debug!("Payload::String, attempting JSON parse");
            serde_json::from_str::<serde_json::Value>(s)
                .ok()
                .and_then(|v| v.get("dps").cloned())
        }
        Payload::Raw(b) => {
            debug!("Payload::Raw ({} bytes), skipping", b.len());
            None
        }
        _ => None,
    }?;

    match dps {
        serde_json::Value::Object(map) => Some(map),
        other => {
            debug!("dps is not a JSON object: {}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_client() -> (TuyaFanClient, mpsc::Receiver<DeviceEvent>) {
        let (events, event_rx) = mpsc::channel(8);
        let config = DeviceConfig {
            id: "bf123".to_string(),
            key: "0123456789abcdef".to_string(),
            ip: None,
            name: "Bedroom Fan".to_string(),
            topic_name: "bedroom_fan".to_string(),
            version: "3.3".to_string(),
        };
        let tuya = TuyaConfig {
            poll_interval_secs: 30,
            discovery_timeout_secs: 10,
        };
        (TuyaFanClient::new(config, &tuya, Discovery::new(), events), event_rx)
    }

    fn query_response(dps: serde_json::Value) -> Message {
        let body = json!({"devId": "bf123", "dps": dps}).to_string();
        Message::new(Payload::String(body), CommandType::DpQuery)
    }

    #[tokio::test]
    async fn failed_queries_leave_no_waiters_behind() {
        let (client, _events) = offline_client();
        for _ in 0..3 {
            assert!(matches!(client.query().await, Err(DeviceError::Query(_))));
        }
        assert!(client.inner.waiting.lock().await.is_empty());
    }

    #[tokio::test]
    async fn abandoned_waiters_are_forgotten() {
        let (client, _events) = offline_client();
        let (live_tx, _live_rx) = oneshot::channel();
        let (gone_tx, gone_rx) = oneshot::channel();
        drop(gone_rx);
        client.inner.waiting.lock().await.extend([live_tx, gone_tx]);

        client.inner.forget_abandoned_waiters().await;
        assert_eq!(client.inner.waiting.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn answered_query_response_is_not_emitted_again() {
        let (client, mut events) = offline_client();
        let (tx, rx) = oneshot::channel();
        client.inner.waiting.lock().await.push(tx);

        assert!(client.inner.dispatch(&query_response(json!({"1": true}))).await);
        assert_eq!(rx.await.unwrap().get("1"), Some(&json!(true)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsolicited_query_response_becomes_a_snapshot() {
        let (client, mut events) = offline_client();
        // Waiter whose caller already gave up.
        let (tx, rx) = oneshot::channel();
        drop(rx);
        client.inner.waiting.lock().await.push(tx);

        assert!(client.inner.dispatch(&query_response(json!({"3": "2"}))).await);
        match events.try_recv() {
            Ok(DeviceEvent::Data(points)) => assert_eq!(points.get("3"), Some(&json!("2"))),
            other => panic!("expected a snapshot, got {other:?}"),
        }
        assert!(client.inner.waiting.lock().await.is_empty());
    }

    #[tokio::test]
    async fn status_push_becomes_a_refresh() {
        let (client, mut events) = offline_client();
        let body = json!({"devId": "bf123", "dps": {"9": false}}).to_string();
        let push = Message::new(Payload::String(body), CommandType::Status);

        assert!(client.inner.dispatch(&push).await);
        assert!(matches!(events.try_recv(), Ok(DeviceEvent::Refresh(_))));
    }

    #[test]
    fn extracts_dps_from_string_payload() {
        let payload = Payload::String(r#"{"devId":"bf123","dps":{"1":true,"3":"2"}}"#.to_string());
        let dps = extract_dps(&payload).unwrap();
        assert_eq!(dps.get("1"), Some(&json!(true)));
        assert_eq!(dps.get("3"), Some(&json!("2")));
    }

    #[test]
    fn extracts_dps_from_struct_payload() {
        let payload = Payload::Struct(PayloadStruct {
            dev_id: "bf123".to_string(),
            gw_id: None,
            uid: None,
            t: None,
            dp_id: None,
            dps: Some(json!({"4": "reverse"})),
        });
        let dps = extract_dps(&payload).unwrap();
        assert_eq!(dps.get("4"), Some(&json!("reverse")));
    }

    #[test]
    fn skips_payloads_without_dps_object() {
        assert!(extract_dps(&Payload::String("not json".to_string())).is_none());
        assert!(extract_dps(&Payload::String(r#"{"dps":[1,2]}"#.to_string())).is_none());
        assert!(extract_dps(&Payload::String(r#"{"t":123}"#.to_string())).is_none());
    }
}
