//! Cloud synchronization over MQTT.
//!
//! Snapshots are buffered locally every cycle and uploaded in batches when
//! the broker connection is up.  Batches are split to fit the broker's
//! packet limit and a batch only counts as uploaded once its PubAck
//! arrives.  A successful upload asks the cloud to retrain; a
//! `model/<id>/available` notification makes the next sync reload the
//! decision model.
//!
//! Topics (for controller `c1`):
//!
//! | direction | topic                 | payload                  |
//! |-----------|-----------------------|--------------------------|
//! | out       | `cloud/c1/readings`   | JSON array of snapshots  |
//! | out       | `cloud/c1/train`      | `{"ts": <unix>}`         |
//! | in        | `model/c1/available`  | anything                 |
//! | in        | `tele/<node>/reading` | [`TelemetryMsg`]         |

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::model::DecisionModel;
use crate::sensors::{TelemetryFeed, TelemetryMsg};
use crate::snapshot::SensorSnapshot;
use crate::state::SharedState;
use crate::supervisor::shutdown_requested;

// ---------------------------------------------------------------------------
// Seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CloudSync: Send + Sync {
    fn is_online(&self) -> bool;

    /// True once the batch was handed to the transport.
    async fn upload_batch(&self, batch: &[SensorSnapshot]) -> bool;

    /// Largest encoded batch the transport accepts in one upload.
    fn max_batch_bytes(&self) -> usize {
        usize::MAX
    }

    /// True when a newer model is available and should be reloaded.
    async fn fetch_latest_model(&self) -> bool;

    async fn trigger_training(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

pub fn readings_topic(controller_id: &str) -> String {
    format!("cloud/{controller_id}/readings")
}

pub fn train_topic(controller_id: &str) -> String {
    format!("cloud/{controller_id}/train")
}

pub fn model_topic(controller_id: &str) -> String {
    format!("model/{controller_id}/available")
}

/// Extract node_id from "tele/<node_id>/reading".
pub fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// What an incoming publish means to the controller.
#[derive(Debug)]
pub enum Inbound<'a> {
    Telemetry(&'a str, TelemetryMsg),
    BadTelemetry(&'a str, String),
    ModelAvailable,
    Unhandled,
}

pub fn route<'a>(controller_id: &str, topic: &'a str, payload: &[u8]) -> Inbound<'a> {
    if let Some(node_id) = extract_node_id(topic) {
        return match serde_json::from_slice::<TelemetryMsg>(payload) {
            Ok(msg) => Inbound::Telemetry(node_id, msg),
            Err(e) => Inbound::BadTelemetry(node_id, e.to_string()),
        };
    }
    if topic == model_topic(controller_id) {
        return Inbound::ModelAvailable;
    }
    Inbound::Unhandled
}

/// Split `batch` into consecutive runs whose JSON array encoding fits in
/// `max_bytes`.  A snapshot that alone exceeds the limit gets its own run.
pub fn split_batch(batch: &[SensorSnapshot], max_bytes: usize) -> Vec<&[SensorSnapshot]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut size = 2; // "[]"
    for (i, snap) in batch.iter().enumerate() {
        let len = serde_json::to_vec(snap).map(|v| v.len()).unwrap_or(0);
        if i > start && size + 1 + len > max_bytes {
            chunks.push(&batch[start..i]);
            start = i;
            size = 2 + len;
        } else {
            size += len + usize::from(i > start);
        }
    }
    if start < batch.len() {
        chunks.push(&batch[start..]);
    }
    chunks
}

// ---------------------------------------------------------------------------
// MQTT transport
// ---------------------------------------------------------------------------

/// Fixed header, topic length and packet id of a QoS 1 publish, rounded up.
const PUBLISH_OVERHEAD: usize = 16;

/// Matches QoS 1 publishes to their PubAck.  Publishes are confirmed one at
/// a time, so the next outgoing packet id belongs to the waiting caller.
#[derive(Default)]
struct AckTracker {
    inner: Mutex<AckState>,
}

#[derive(Default)]
struct AckState {
    queued: Option<oneshot::Sender<()>>,
    sent: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn lock(&self) -> MutexGuard<'_, AckState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expect(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().queued = Some(tx);
        rx
    }

    fn sent(&self, pkid: u16) {
        let mut state = self.lock();
        if let Some(tx) = state.queued.take() {
            state.sent.insert(pkid, tx);
        }
    }

    fn acked(&self, pkid: u16) {
        if let Some(tx) = self.lock().sent.remove(&pkid) {
            // The publisher may already have given up waiting.
            let _ = tx.send(());
        }
    }

    /// Dropping the senders fails every waiting publish.
    fn fail_all(&self) {
        let mut state = self.lock();
        state.queued = None;
        state.sent.clear();
    }
}

pub struct MqttCloud {
    client: AsyncClient,
    controller_id: String,
    online: AtomicBool,
    model_available: AtomicBool,
    subscribe_telemetry: bool,
    timeout: Duration,
    max_payload: usize,
    acks: AckTracker,
    publishing: tokio::sync::Mutex<()>,
}

impl MqttCloud {
    /// Build the client.  Nothing is sent until the returned event loop is
    /// driven by [`pump_events`].
    pub fn new(
        cfg: &MqttConfig,
        controller_id: &str,
        subscribe_telemetry: bool,
        timeout: Duration,
    ) -> (Arc<Self>, EventLoop) {
        let mut options = MqttOptions::new(controller_id, cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_seconds));
        options.set_max_packet_size(cfg.max_packet_bytes, cfg.max_packet_bytes);
        let (client, eventloop) = AsyncClient::new(options, 20);
        let max_payload = cfg
            .max_packet_bytes
            .saturating_sub(PUBLISH_OVERHEAD + readings_topic(controller_id).len());

        let cloud = Arc::new(Self {
            client,
            controller_id: controller_id.to_string(),
            online: AtomicBool::new(false),
            model_available: AtomicBool::new(false),
            subscribe_telemetry,
            timeout,
            max_payload,
            acks: AckTracker::default(),
            publishing: tokio::sync::Mutex::new(()),
        });
        (cloud, eventloop)
    }

    /// QoS 1 publish that succeeds only once the broker's PubAck arrives.
    async fn publish(&self, topic: String, payload: Vec<u8>) -> bool {
        let _one_at_a_time = self.publishing.lock().await;
        let acked = self.acks.expect();
        let confirmed = async {
            self.client
                .publish(&topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| e.to_string())?;
            acked
                .await
                .map_err(|_| "connection lost before PubAck".to_string())
        };

        match timeout(self.timeout, confirmed).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(%topic, "mqtt publish failed: {e}");
                self.acks.fail_all();
                false
            }
            Err(_) => {
                warn!(%topic, "mqtt publish not acknowledged in time");
                self.acks.fail_all();
                false
            }
        }
    }

    /// Subscriptions are renewed on every (re)connect.
    fn subscribe(&self) {
        let mut topics = vec![model_topic(&self.controller_id)];
        if self.subscribe_telemetry {
            topics.push("tele/+/reading".to_string());
        }
        for topic in topics {
            match self.client.try_subscribe(&topic, QoS::AtLeastOnce) {
                Ok(()) => info!(%topic, "subscribed"),
                Err(e) => warn!(%topic, "subscribe failed: {e}"),
            }
        }
    }
}

#[async_trait]
impl CloudSync for MqttCloud {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn upload_batch(&self, batch: &[SensorSnapshot]) -> bool {
        let payload = match serde_json::to_vec(batch) {
            Ok(p) => p,
            Err(e) => {
                error!("could not encode upload batch: {e}");
                return false;
            }
        };
        if payload.len() > self.max_payload {
            error!(
                bytes = payload.len(),
                limit = self.max_payload,
                "upload batch exceeds the mqtt packet limit"
            );
            return false;
        }
        self.publish(readings_topic(&self.controller_id), payload).await
    }

    fn max_batch_bytes(&self) -> usize {
        self.max_payload
    }

    async fn fetch_latest_model(&self) -> bool {
        self.model_available.swap(false, Ordering::SeqCst)
    }

    async fn trigger_training(&self) -> bool {
        let payload = serde_json::json!({ "ts": OffsetDateTime::now_utc().unix_timestamp() });
        self.publish(train_topic(&self.controller_id), payload.to_string().into_bytes())
            .await
    }
}

/// Drive the MQTT connection until shutdown: track connectivity, feed
/// telemetry into `feed`, and flag model notifications.
pub async fn pump_events(
    cloud: Arc<MqttCloud>,
    mut eventloop: EventLoop,
    feed: Option<Arc<TelemetryFeed>>,
    shared: SharedState,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            ev = eventloop.poll() => ev,
            _ = shutdown_requested(&mut shutdown) => break,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                match route(&cloud.controller_id, &p.topic, &p.payload) {
                    Inbound::Telemetry(node_id, msg) => {
                        debug!(node = %node_id, ts = msg.ts, readings = msg.readings.len(), "telemetry");
                        match &feed {
                            Some(feed) => feed.ingest(node_id, &msg),
                            None => debug!(node = %node_id, "telemetry ignored (sim backend)"),
                        }
                    }
                    Inbound::BadTelemetry(node_id, e) => {
                        warn!(node = %node_id, "bad telemetry json: {e}");
                        shared
                            .write()
                            .await
                            .record_error(format!("bad telemetry json from {node_id}: {e}"));
                    }
                    Inbound::ModelAvailable => {
                        info!("new decision model available");
                        cloud.model_available.store(true, Ordering::SeqCst);
                    }
                    Inbound::Unhandled => debug!(topic = %p.topic, "unhandled topic"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                cloud.online.store(true, Ordering::SeqCst);
                cloud.subscribe();
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => cloud.acks.sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => cloud.acks.acked(ack.pkid),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                cloud.online.store(false, Ordering::SeqCst);
                cloud.acks.fail_all();
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                cloud.online.store(false, Ordering::SeqCst);
                cloud.acks.fail_all();
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
    info!("mqtt event pump stopped");
}

// ---------------------------------------------------------------------------
// Offline buffer
// ---------------------------------------------------------------------------

/// Bounded FIFO of snapshots awaiting upload.  When full, the oldest
/// snapshot is dropped.
pub struct SyncBuffer {
    pending: Mutex<VecDeque<SensorSnapshot>>,
    capacity: usize,
}

impl SyncBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SensorSnapshot>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn push(&self, snapshot: SensorSnapshot) {
        let mut q = self.lock();
        if q.len() >= self.capacity {
            q.pop_front();
            debug!(capacity = self.capacity, "sync buffer full, oldest snapshot dropped");
        }
        q.push_back(snapshot);
    }

    pub fn take_all(&self) -> Vec<SensorSnapshot> {
        self.lock().drain(..).collect()
    }

    /// Put a failed batch back in front of anything buffered since.
    pub fn requeue(&self, batch: Vec<SensorSnapshot>) {
        let mut q = self.lock();
        for snap in batch.into_iter().rev() {
            q.push_front(snap);
        }
        while q.len() > self.capacity {
            q.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Sync worker
// ---------------------------------------------------------------------------

pub struct CloudSyncer {
    cloud: Arc<dyn CloudSync>,
    model: Arc<dyn DecisionModel>,
    buffer: SyncBuffer,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag however the sync ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CloudSyncer {
    pub fn new(cloud: Arc<dyn CloudSync>, model: Arc<dyn DecisionModel>, capacity: usize) -> Self {
        Self {
            cloud,
            model,
            buffer: SyncBuffer::new(capacity),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_online(&self) -> bool {
        self.cloud.is_online()
    }

    pub fn enqueue(&self, snapshot: SensorSnapshot) {
        self.buffer.push(snapshot);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Fire-and-forget sync.  `None` while a previous one is still running.
    pub fn spawn_sync(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("cloud sync still running, not starting another");
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _flag = InFlight(&this.in_flight);
            this.sync_once().await;
        }))
    }

    /// Upload buffered snapshots, request training, then pick up a new model.
    ///
    /// Batches go out in order; the first failed one and everything after
    /// it are re-queued.
    pub async fn sync_once(&self) {
        let mut batch = self.buffer.take_all();
        if !batch.is_empty() {
            let mut uploaded = 0;
            for chunk in split_batch(&batch, self.cloud.max_batch_bytes()) {
                if !self.cloud.upload_batch(chunk).await {
                    break;
                }
                uploaded += chunk.len();
            }

            if uploaded > 0 {
                info!(snapshots = uploaded, "uploaded snapshots");
                if !self.cloud.trigger_training().await {
                    warn!("training trigger not sent");
                }
            }
            if uploaded < batch.len() {
                let rest = batch.split_off(uploaded);
                warn!(snapshots = rest.len(), "upload failed, snapshots re-queued");
                self.buffer.requeue(rest);
            }
        }

        if self.cloud.fetch_latest_model().await {
            match self.model.reload() {
                Ok(()) => info!("decision model reloaded"),
                Err(e) => warn!("decision model reload failed, keeping previous: {e}"),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
