use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{convert, dp};
use super::{
    Characteristic, CharacteristicSink, CharacteristicValue, DataPointMap, DeviceClient,
    DeviceEvent, SurfaceRequest, WritePolicies, WritePolicy,
};

/// Connectivity as observed by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Constructed,
    Discovering,
    Connected,
    Disconnected,
}

const TRACKED_DPS: [&str; 4] = [dp::POWER, dp::SPEED, dp::DIRECTION, dp::LIGHT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileKind {
    Snapshot,
    Refresh,
}

/// Keeps the raw DP cache of one fan in step with the device and the
/// characteristic surface. The synchronizer is the only writer of its cache.
pub struct FanSynchronizer {
    name: String,
    client: Arc<dyn DeviceClient>,
    sink: Arc<dyn CharacteristicSink>,
    policies: WritePolicies,
    confirm_timeout: Option<Duration>,
    cache: DataPointMap,
    state: ConnectionState,
    /// Write deadlines per DP id, cleared when the device reports that DP.
    pending: HashMap<&'static str, Instant>,
}

impl FanSynchronizer {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn DeviceClient>,
        sink: Arc<dyn CharacteristicSink>,
        policies: WritePolicies,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            sink,
            policies,
            confirm_timeout: None,
            cache: DataPointMap::new(),
            state: ConnectionState::Constructed,
            pending: HashMap::new(),
        }
    }

    /// Re-query the device when a write is not confirmed within `timeout`.
    pub fn with_confirm_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.confirm_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn cache(&self) -> &DataPointMap {
        &self.cache
    }

    /// Semantic value derived from the cache, without touching the device.
    pub fn current(&self, characteristic: Characteristic) -> Option<CharacteristicValue> {
        convert::from_cache(characteristic, &self.cache)
    }

    /// Discover and connect, then serve device events and surface requests
    /// until the device event channel closes.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<DeviceEvent>,
        mut requests: mpsc::Receiver<SurfaceRequest>,
    ) {
        self.start().await;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Event channel closed for {}", self.name);
                        break;
                    }
                },
                Some(request) = requests.recv() => {
                    self.handle_request(request).await;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_unconfirmed().await;
                }
            }
        }
    }

    pub async fn start(&mut self) {
        self.state = ConnectionState::Discovering;
        info!("Discovering {}", self.name);

        match self.client.discover().await {
            Ok(ip) => info!("Found {} at {}", self.name, ip),
            Err(e) => {
                error!("Discovery of {} failed: {}", self.name, e);
                self.state = ConnectionState::Disconnected;
                return;
            }
        }

        if let Err(e) = self.client.connect().await {
            error!("Connecting to {} failed: {}", self.name, e);
            self.state = ConnectionState::Disconnected;
        }
    }

    pub async fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Connected => {
                debug!("Device connected: {}", self.name);
                self.state = ConnectionState::Connected;
                self.refresh_from_device().await;
            }
            DeviceEvent::Disconnected => {
                debug!("Device disconnected: {}", self.name);
                self.state = ConnectionState::Disconnected;
            }
            DeviceEvent::Error(detail) => {
                debug!("Device error on {}: {}", self.name, detail);
            }
            DeviceEvent::Data(points) => {
                debug!("Device data from {}: {:?}", self.name, points);
                self.reconcile(ReconcileKind::Snapshot, points);
            }
            DeviceEvent::Refresh(points) => {
                debug!("Device refresh from {}: {:?}", self.name, points);
                self.reconcile(ReconcileKind::Refresh, points);
            }
        }
    }

    pub async fn handle_request(&mut self, request: SurfaceRequest) {
        match request {
            SurfaceRequest::Write {
                characteristic,
                value,
            } => self.apply_write(characteristic, value).await,
            SurfaceRequest::Read {
                characteristic,
                reply,
            } => {
                let value = self.read(characteristic).await;
                // Nobody waiting is fine; the value was pushed to the sink anyway.
                let _ = reply.send(value);
            }
        }
    }

    /// Send a semantic write to the device. Under the optimistic policy the
    /// cache and surface change before the device is contacted. Failures are
    /// logged only; an optimistic guess stays until the device reports again.
    pub async fn apply_write(&mut self, characteristic: Characteristic, value: CharacteristicValue) {
        let dp_id = characteristic.dp_id();
        let raw = convert::to_raw(characteristic, value);
        let policy = self.policies.for_characteristic(characteristic);

        debug!(
            "Set {} {} -> {} (dp {} = {}, {:?})",
            self.name, characteristic, value, dp_id, raw, policy
        );

        if self.state != ConnectionState::Connected {
            debug!("{} is not connected, attempting write anyway", self.name);
        }

        if policy == WritePolicy::Optimistic {
            self.cache.insert(dp_id.to_string(), raw.clone());
            self.push(characteristic);
        }

        if let Some(timeout) = self.confirm_timeout {
            self.pending.insert(dp_id, Instant::now() + timeout);
        }

        if let Err(e) = self.client.set(dp_id, raw).await {
            warn!("Failed to set {} on {}: {}", characteristic, self.name, e);
        }
    }

    /// Query the device and answer from the refreshed cache. A failed query
    /// answers from the cache as it stands.
    pub async fn read(&mut self, characteristic: Characteristic) -> Option<CharacteristicValue> {
        self.refresh_from_device().await;
        self.current(characteristic)
    }

    async fn refresh_from_device(&mut self) {
        match self.client.query().await {
            Ok(points) => self.reconcile(ReconcileKind::Snapshot, points),
            Err(e) => warn!("Query of {} failed: {}", self.name, e),
        }
    }

    /// Overlay device-reported DPs on the cache and push every characteristic.
    /// A snapshot also replaces the tracked DPs: one it omits is forgotten.
    fn reconcile(&mut self, kind: ReconcileKind, points: DataPointMap) {
        debug!("Reconciling {} DPs ({:?}) for {}", points.len(), kind, self.name);
        if kind == ReconcileKind::Snapshot {
            for dp_id in TRACKED_DPS {
                if !points.contains_key(dp_id) {
                    self.cache.remove(dp_id);
                }
            }
        }
        for dp_id in points.keys() {
            self.pending.remove(dp_id.as_str());
        }
        self.cache.extend(points);
        self.push_all();
    }

    fn push_all(&self) {
        for characteristic in Characteristic::ALL {
            self.push(characteristic);
        }
    }

    fn push(&self, characteristic: Characteristic) {
        if let Some(value) = self.current(characteristic) {
            self.sink.update(characteristic, value);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    async fn expire_unconfirmed(&mut self) {
        let now = Instant::now();
        let expired: Vec<&'static str> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(dp_id, _)| *dp_id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for dp_id in &expired {
            self.pending.remove(dp_id);
        }

        warn!(
            "{} did not confirm DPs {:?}, re-querying device state",
            self.name, expired
        );
        self.refresh_from_device().await;
    }
}
