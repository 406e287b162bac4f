//! Stream connection to a single radio.
//!
//! A connection owns one byte transport and three background loops:
//!
//! - **reader**: a blocking thread that reads up to 1024 bytes at a time, feeds them to
//!   the hardened frame parser and dispatches every decoded `FromRadio`.
//! - **writer**: a 10 ms ticker that drains the flow-controlled outbound queue one
//!   packet at a time. Packets that want an ack wait for room in the ack window.
//! - **heartbeat**: optional; sends a `ToRadio` heartbeat on a long interval while
//!   connected so the firmware keeps the serial API session alive. Left off when a
//!   supervisor such as `HeartbeatManager` owns keep-alives.
//!
//! Connecting wakes the radio with a burst of `0xC3` bytes, asks for the full device
//! configuration and waits for the matching `config_complete_id`. Loss of the stream
//! (EOF, read error or a corrupt stream) moves the connection to `Disconnected` and
//! fires the disconnect callback; recovering from that is the manager's job.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use prost::Message;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::{MeshError, Result};
use super::framer::{Frame, FrameError, FrameSink, START2};
use super::queue::{FlowControlStats, FlowControlledQueue, QueueStats};
use super::robust::{RobustFrameBuilder, RobustFrameParser};
use super::state::{DeviceState, StateMachine, StateObserver, StateTransition};
use super::transport::{is_idle_error, Transport};
use super::{lock, read_lock, write_lock};
use crate::logutil::{escape_log, hex_dump, hex_snippet, LineAssembler};
use crate::metrics::{ConnectionStats, LinkCounters};
use crate::protobuf::meshtastic_generated as proto;
use crate::protobuf::{
    data_packet, packet_data, to_radio_heartbeat, to_radio_packet, to_radio_want_config,
    BROADCAST_ADDR,
};

use proto::admin_message::PayloadVariant as AdminVariant;
use proto::from_radio::PayloadVariant as FromRadioVariant;

const WAKE_BYTES: usize = 32;
const READ_CHUNK: usize = 1024;
/// Largest application payload the firmware accepts in one packet.
pub const MAX_DATA_PAYLOAD: usize = 233;

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub config_timeout: Duration,
    pub admin_timeout: Duration,
    /// `None` disables the connection's own heartbeat loop.
    pub heartbeat_interval: Option<Duration>,
    pub writer_tick: Duration,
    pub queue_capacity: usize,
    pub max_window: usize,
    pub ack_timeout: Duration,
    pub ack_required: bool,
    pub wake_settle: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            config_timeout: Duration::from_secs(30),
            admin_timeout: Duration::from_secs(30),
            heartbeat_interval: Some(Duration::from_secs(300)),
            writer_tick: Duration::from_millis(10),
            queue_capacity: 100,
            max_window: 10,
            ack_timeout: Duration::from_secs(30),
            ack_required: true,
            wake_settle: Duration::from_millis(100),
        }
    }
}

/// A text message received from the mesh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMessage {
    pub id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub text: String,
}

pub type PacketCallback = Arc<dyn Fn(&proto::MeshPacket) + Send + Sync>;
pub type TextCallback = Arc<dyn Fn(&TextMessage) + Send + Sync>;
pub type NodeInfoCallback = Arc<dyn Fn(&proto::NodeInfo) + Send + Sync>;
pub type PositionCallback = Arc<dyn Fn(u32, &proto::Position) + Send + Sync>;
pub type TelemetryCallback = Arc<dyn Fn(u32, &proto::Telemetry) + Send + Sync>;
pub type LogLineCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&MeshError) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    on_message: Option<PacketCallback>,
    on_text: Option<TextCallback>,
    on_node_info: Option<NodeInfoCallback>,
    on_position: Option<PositionCallback>,
    on_telemetry: Option<TelemetryCallback>,
    on_log_line: Option<LogLineCallback>,
    on_disconnect: Option<DisconnectCallback>,
}

#[derive(Default)]
struct DeviceCache {
    my_info: Option<proto::MyNodeInfo>,
    nodes: HashMap<u32, proto::NodeInfo>,
    channels: BTreeMap<i32, proto::Channel>,
    local_config: proto::LocalConfig,
    module_config: proto::LocalModuleConfig,
    metadata: Option<proto::DeviceMetadata>,
}

#[derive(Default)]
struct Tasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkQueueStatus {
    pub queue: QueueStats,
    pub flow: FlowControlStats,
}

struct Shared {
    device_path: String,
    settings: StreamSettings,
    transport: Mutex<Option<Box<dyn Transport>>>,
    builder: Mutex<RobustFrameBuilder>,
    state: StateMachine,
    cache: RwLock<DeviceCache>,
    callbacks: RwLock<Callbacks>,
    queue: FlowControlledQueue<proto::MeshPacket>,
    responses: Mutex<HashMap<u32, oneshot::Sender<proto::AdminMessage>>>,
    config_complete: watch::Sender<Option<u32>>,
    counters: LinkCounters,
    packet_id: AtomicU32,
    tasks: Mutex<Tasks>,
}

/// Connection to one radio over a byte transport.
pub struct StreamConnection {
    shared: Arc<Shared>,
}

impl StreamConnection {
    pub fn new(
        transport: Box<dyn Transport>,
        device_path: impl Into<String>,
        settings: StreamSettings,
    ) -> Self {
        let queue = FlowControlledQueue::new(
            settings.queue_capacity,
            settings.max_window,
            settings.ack_timeout,
        );
        queue.set_ack_required(settings.ack_required);
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1);
        let (config_complete, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                device_path: device_path.into(),
                settings,
                transport: Mutex::new(Some(transport)),
                builder: Mutex::new(RobustFrameBuilder::new()),
                state: StateMachine::new(),
                cache: RwLock::new(DeviceCache::default()),
                callbacks: RwLock::new(Callbacks::default()),
                queue,
                responses: Mutex::new(HashMap::new()),
                config_complete,
                counters: LinkCounters::new(),
                packet_id: AtomicU32::new(seed),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Start the loops, wake the radio and complete the configuration handshake.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.stop_tasks().await;
        let shared = &self.shared;
        shared.state.change_state(DeviceState::Connecting);
        shared.config_complete.send_replace(None);
        info!("Connecting to {}", shared.device_path);

        let token = CancellationToken::new();
        if let Err(e) = self.spawn_tasks(&token) {
            shared.state.change_state(DeviceState::Error);
            return Err(e.context("failed to start connection tasks"));
        }

        if let Err(e) = self.handshake(&token).await {
            error!("Connection to {} failed: {}", shared.device_path, e);
            shared.state.change_state(DeviceState::Error);
            self.stop_tasks().await;
            return Err(e);
        }

        shared.counters.mark_connected(Some(Utc::now()));
        shared.state.change_state(DeviceState::Connected);
        info!("Connected to {}", shared.device_path);
        Ok(())
    }

    async fn handshake(&self, token: &CancellationToken) -> Result<()> {
        self.shared
            .write_bytes(&[START2; WAKE_BYTES])
            .map_err(|e| e.context("failed to send wake-up sequence"))?;
        tokio::time::sleep(self.shared.settings.wake_settle).await;

        self.shared.state.change_state(DeviceState::Configuring);
        let config_id = rand::random::<u32>().max(1);
        self.send_want_config(config_id)
            .map_err(|e| e.context("failed to request configuration"))?;
        match self
            .wait_for_config(config_id, self.shared.settings.config_timeout, token)
            .await
        {
            Ok(()) => Ok(()),
            // The reader cancels the token when the stream dies mid-handshake.
            Err(MeshError::Cancelled) => {
                Err(MeshError::NotConnected.context("connection lost during configuration"))
            }
            Err(e) => Err(e.context("configuration handshake failed")),
        }
    }

    fn spawn_tasks(&self, token: &CancellationToken) -> Result<()> {
        let reader = {
            let guard = lock(&self.shared.transport);
            let transport = guard.as_ref().ok_or(MeshError::NotConnected)?;
            transport.try_clone()?
        };
        let mut handles = Vec::with_capacity(3);

        let shared = self.shared.clone();
        let t = token.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            shared.read_loop(reader, &t)
        }));

        let shared = self.shared.clone();
        let t = token.clone();
        handles.push(tokio::spawn(async move { shared.write_loop(&t).await }));

        if let Some(interval) = self.shared.settings.heartbeat_interval {
            let shared = self.shared.clone();
            let t = token.clone();
            handles.push(tokio::spawn(async move {
                shared.heartbeat_loop(interval, &t).await
            }));
        }

        let mut tasks = lock(&self.shared.tasks);
        tasks.cancel = token.clone();
        tasks.handles = handles;
        Ok(())
    }

    async fn stop_tasks(&self) {
        let handles = {
            let mut tasks = lock(&self.shared.tasks);
            tasks.cancel.cancel();
            std::mem::take(&mut tasks.handles)
        };
        for h in handles {
            if tokio::time::timeout(Duration::from_secs(2), h).await.is_err() {
                warn!("Connection task did not stop within 2s");
            }
        }
    }

    /// Stop the loops and mark the link disconnected. The transport is kept.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_tasks().await;
        self.shared.state.change_state(DeviceState::Disconnected);
        self.shared.counters.mark_connected(None);
        self.shared.fail_pending_requests();
        info!("Disconnected from {}", self.shared.device_path);
        Ok(())
    }

    /// Disconnect, tell the radio we are leaving, and release the transport.
    pub async fn close(&self) -> Result<()> {
        let bye = proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Disconnect(true)),
        };
        if let Err(e) = self.shared.write_to_radio(&bye) {
            debug!("Disconnect notice not sent: {}", e);
        }
        self.disconnect().await?;
        self.shared.queue.close();
        lock(&self.shared.transport).take();
        Ok(())
    }

    /// Swap in a freshly opened transport, e.g. after the device re-enumerated.
    pub fn set_transport(&self, transport: Box<dyn Transport>) {
        debug!("Attaching transport {}", transport.name());
        *lock(&self.shared.transport) = Some(transport);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == DeviceState::Connected
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state.current()
    }

    /// Record a state decided outside the connection, e.g. by a reconnect supervisor.
    pub fn set_state(&self, state: DeviceState) {
        self.shared.state.change_state(state);
    }

    pub fn state_history(&self) -> Vec<StateTransition> {
        self.shared.state.history()
    }

    pub fn device_path(&self) -> &str {
        &self.shared.device_path
    }

    pub fn my_info(&self) -> Option<proto::MyNodeInfo> {
        read_lock(&self.shared.cache).my_info.clone()
    }

    pub fn nodes(&self) -> Vec<proto::NodeInfo> {
        let cache = read_lock(&self.shared.cache);
        let mut nodes: Vec<_> = cache.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.num);
        nodes
    }

    pub fn channels(&self) -> Vec<proto::Channel> {
        read_lock(&self.shared.cache)
            .channels
            .values()
            .cloned()
            .collect()
    }

    pub fn local_config(&self) -> proto::LocalConfig {
        read_lock(&self.shared.cache).local_config.clone()
    }

    pub fn local_module_config(&self) -> proto::LocalModuleConfig {
        read_lock(&self.shared.cache).module_config.clone()
    }

    pub fn metadata(&self) -> Option<proto::DeviceMetadata> {
        read_lock(&self.shared.cache).metadata.clone()
    }

    pub fn next_packet_id(&self) -> u32 {
        self.shared.next_packet_id()
    }

    /// Queue a packet for the writer. A zero id is replaced with a fresh one.
    pub fn send_message(&self, mut packet: proto::MeshPacket) -> Result<u32> {
        if !self.is_connected() {
            return Err(MeshError::NotConnected);
        }
        if packet.id == 0 {
            packet.id = self.shared.next_packet_id();
        }
        let id = packet.id;
        self.shared.queue.enqueue(packet)?;
        Ok(id)
    }

    /// Send a text message; returns the packet id.
    pub fn send_text(&self, text: &str, destination: u32, channel: u32) -> Result<u32> {
        if text.len() > MAX_DATA_PAYLOAD {
            return Err(MeshError::FrameTooLarge {
                size: text.len(),
                max: MAX_DATA_PAYLOAD,
            });
        }
        let id = self.shared.next_packet_id();
        let packet = data_packet(
            id,
            destination,
            channel,
            proto::PortNum::TextMessageApp,
            text.as_bytes().to_vec(),
            true,
        );
        debug!(
            "Queueing text id={} to={:08x} ch={} '{}'",
            id,
            destination,
            channel,
            escape_log(text)
        );
        self.send_message(packet)
    }

    pub fn send_heartbeat(&self) -> Result<()> {
        self.shared
            .write_to_radio(&to_radio_heartbeat(rand::random()))
    }

    pub fn send_want_config(&self, config_id: u32) -> Result<()> {
        debug!("Requesting configuration (id={})", config_id);
        self.shared.write_to_radio(&to_radio_want_config(config_id))
    }

    /// Wait for the radio to finish streaming the configuration for `config_id`.
    pub async fn wait_for_config(
        &self,
        config_id: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut rx = self.shared.config_complete.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == Some(config_id) {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(MeshError::NotConnected);
                }
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(MeshError::Cancelled),
            res = tokio::time::timeout(timeout, wait) => {
                res.map_err(|_| MeshError::Timeout("configuration"))?
            }
        }
    }

    /// Send an admin request and wait for the correlated response.
    pub async fn send_admin_message(
        &self,
        message: proto::AdminMessage,
    ) -> Result<proto::AdminMessage> {
        if !self.is_connected() {
            return Err(MeshError::NotConnected);
        }
        let id = self.shared.next_packet_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.responses).insert(id, tx);

        let result = self.request_admin(id, message, rx).await;
        lock(&self.shared.responses).remove(&id);
        result
    }

    async fn request_admin(
        &self,
        id: u32,
        message: proto::AdminMessage,
        rx: oneshot::Receiver<proto::AdminMessage>,
    ) -> Result<proto::AdminMessage> {
        let mut packet = data_packet(
            id,
            BROADCAST_ADDR,
            0,
            proto::PortNum::AdminApp,
            message.encode_to_vec(),
            false,
        );
        if let Some(proto::mesh_packet::PayloadVariant::Decoded(d)) = packet.payload_variant.as_mut() {
            d.want_response = true;
        }
        self.shared.queue.enqueue_priority(packet)?;

        let cancel = lock(&self.shared.tasks).cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(MeshError::NotConnected),
            res = tokio::time::timeout(self.shared.settings.admin_timeout, rx) => match res {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(_)) => Err(MeshError::NotConnected),
                Err(_) => Err(MeshError::Timeout("admin response")),
            },
        }
    }

    pub async fn get_config(&self, kind: proto::admin_message::ConfigType) -> Result<proto::Config> {
        let req = admin(AdminVariant::GetConfigRequest(kind as i32));
        match self.send_admin_message(req).await?.payload_variant {
            Some(AdminVariant::GetConfigResponse(c)) => Ok(c),
            _ => Err(MeshError::UnexpectedResponse("config")),
        }
    }

    pub async fn get_module_config(
        &self,
        kind: proto::admin_message::ModuleConfigType,
    ) -> Result<proto::ModuleConfig> {
        let req = admin(AdminVariant::GetModuleConfigRequest(kind as i32));
        match self.send_admin_message(req).await?.payload_variant {
            Some(AdminVariant::GetModuleConfigResponse(c)) => Ok(c),
            _ => Err(MeshError::UnexpectedResponse("module config")),
        }
    }

    /// Channel by zero-based index.
    pub async fn get_channel(&self, index: u32) -> Result<proto::Channel> {
        // The firmware numbers channel requests from one.
        let req = admin(AdminVariant::GetChannelRequest(index + 1));
        match self.send_admin_message(req).await?.payload_variant {
            Some(AdminVariant::GetChannelResponse(c)) => Ok(c),
            _ => Err(MeshError::UnexpectedResponse("channel")),
        }
    }

    pub async fn get_owner(&self) -> Result<proto::User> {
        match self
            .send_admin_message(admin(AdminVariant::GetOwnerRequest(true)))
            .await?
            .payload_variant
        {
            Some(AdminVariant::GetOwnerResponse(u)) => Ok(u),
            _ => Err(MeshError::UnexpectedResponse("owner")),
        }
    }

    pub async fn get_device_metadata(&self) -> Result<proto::DeviceMetadata> {
        match self
            .send_admin_message(admin(AdminVariant::GetDeviceMetadataRequest(true)))
            .await?
            .payload_variant
        {
            Some(AdminVariant::GetDeviceMetadataResponse(m)) => Ok(m),
            _ => Err(MeshError::UnexpectedResponse("device metadata")),
        }
    }

    /// Ask the radio to reboot after `seconds`. No response is expected.
    pub fn reboot(&self, seconds: i32) -> Result<()> {
        if !self.is_connected() {
            return Err(MeshError::NotConnected);
        }
        let id = self.shared.next_packet_id();
        let packet = data_packet(
            id,
            BROADCAST_ADDR,
            0,
            proto::PortNum::AdminApp,
            admin(AdminVariant::RebootSeconds(seconds)).encode_to_vec(),
            false,
        );
        info!("Requesting reboot in {}s", seconds);
        self.shared.queue.enqueue_priority(packet)
    }

    pub fn queue_status(&self) -> LinkQueueStatus {
        LinkQueueStatus {
            queue: self.shared.queue.queue().stats(),
            flow: self.shared.queue.flow_stats(),
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.counters.snapshot()
    }

    pub fn set_on_message(&self, cb: PacketCallback) {
        write_lock(&self.shared.callbacks).on_message = Some(cb);
    }

    pub fn set_on_text(&self, cb: TextCallback) {
        write_lock(&self.shared.callbacks).on_text = Some(cb);
    }

    pub fn set_on_node_info(&self, cb: NodeInfoCallback) {
        write_lock(&self.shared.callbacks).on_node_info = Some(cb);
    }

    pub fn set_on_position(&self, cb: PositionCallback) {
        write_lock(&self.shared.callbacks).on_position = Some(cb);
    }

    pub fn set_on_telemetry(&self, cb: TelemetryCallback) {
        write_lock(&self.shared.callbacks).on_telemetry = Some(cb);
    }

    pub fn set_on_log_line(&self, cb: LogLineCallback) {
        write_lock(&self.shared.callbacks).on_log_line = Some(cb);
    }

    pub fn set_on_disconnect(&self, cb: DisconnectCallback) {
        write_lock(&self.shared.callbacks).on_disconnect = Some(cb);
    }

    pub fn set_on_state_change(&self, cb: StateObserver) {
        self.shared.state.set_observer(Some(cb));
    }

    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.state.subscribe()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        // Blocking reader threads would otherwise keep the runtime from shutting down.
        lock(&self.shared.tasks).cancel.cancel();
    }
}

fn admin(variant: AdminVariant) -> proto::AdminMessage {
    proto::AdminMessage {
        payload_variant: Some(variant),
    }
}

impl Shared {
    fn next_packet_id(&self) -> u32 {
        loop {
            let id = self.packet_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let mut guard = lock(&self.transport);
        let transport = guard.as_mut().ok_or(MeshError::NotConnected)?;
        let res = transport.write_all(data).and_then(|_| transport.flush());
        match res {
            Ok(()) => {
                self.counters.add_bytes_written(data.len());
                Ok(())
            }
            Err(e) => {
                self.counters.inc_write_errors();
                Err(e.into())
            }
        }
    }

    fn write_to_radio(&self, msg: &proto::ToRadio) -> Result<()> {
        let frame = lock(&self.builder).build_to_radio(msg)?;
        trace!("TX {} bytes: {}", frame.len(), hex_snippet(&frame, 32));
        self.write_bytes(&frame)?;
        self.counters.inc_frames_sent();
        Ok(())
    }

    fn send_packet_now(&self, packet: proto::MeshPacket) -> Result<()> {
        let id = packet.id;
        let want_ack = packet.want_ack;
        // Registered before the write so a fast ack cannot overtake it.
        if want_ack {
            self.queue.message_sent(id);
        }
        if let Err(e) = self.write_to_radio(&to_radio_packet(packet)) {
            if want_ack {
                self.queue.message_acked(id);
            }
            return Err(e);
        }
        Ok(())
    }

    fn read_loop(&self, mut transport: Box<dyn Transport>, token: &CancellationToken) {
        let mut parser = RobustFrameParser::new();
        let mut lines = LineAssembler::new();
        let mut buf = [0u8; READ_CHUNK];
        debug!("Reader started on {}", transport.name());
        while !token.is_cancelled() {
            let n = match transport.read(&mut buf) {
                Ok(0) => {
                    self.handle_disconnect(token, MeshError::NotConnected.context("device closed the stream"));
                    break;
                }
                Ok(n) => n,
                Err(e) if is_idle_error(&e) => continue,
                Err(e) => {
                    self.counters.inc_read_errors();
                    self.handle_disconnect(token, MeshError::Io(e).context("serial read failed"));
                    break;
                }
            };
            self.counters.add_bytes_read(n);
            trace!("RX {} bytes: {}", n, hex_snippet(&buf[..n], 64));
            let mut sink = Dispatcher {
                shared: self,
                lines: &mut lines,
            };
            if let Err(e) = parser.feed(&buf[..n], &mut sink) {
                self.handle_disconnect(token, e);
                break;
            }
        }
        if let Some(line) = lines.take() {
            self.emit_log_line(&line);
        }
        debug!("Reader stopped");
    }

    async fn write_loop(&self, token: &CancellationToken) {
        let mut tick = tokio::time::interval(self.settings.writer_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    self.queue.cleanup_expired_acks();
                    // Only packets that will be acked take a window slot.
                    let Ok(Some(packet)) = self.queue.dequeue_ready(|p| p.want_ack) else {
                        continue;
                    };
                    let id = packet.id;
                    if let Err(e) = self.send_packet_now(packet) {
                        warn!("Failed to send packet id={}: {}", id, e);
                    }
                }
            }
        }
        debug!("Writer stopped");
    }

    async fn heartbeat_loop(&self, interval: Duration, token: &CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    if self.state.current() != DeviceState::Connected {
                        continue;
                    }
                    match self.write_to_radio(&to_radio_heartbeat(rand::random())) {
                        Ok(()) => trace!("Heartbeat sent"),
                        Err(e) => debug!("Heartbeat send error: {}", e),
                    }
                }
            }
        }
    }

    fn handle_disconnect(&self, token: &CancellationToken, cause: MeshError) {
        if token.is_cancelled() {
            return;
        }
        token.cancel();
        let was_connected = self.state.current() == DeviceState::Connected;
        self.state.change_state(DeviceState::Disconnected);
        self.counters.mark_connected(None);
        self.fail_pending_requests();
        warn!("Lost connection to {}: {}", self.device_path, cause);
        if was_connected {
            let cb = read_lock(&self.callbacks).on_disconnect.clone();
            if let Some(cb) = cb {
                cb(&cause);
            }
        }
    }

    fn fail_pending_requests(&self) {
        // Dropping the senders wakes each waiter with an error.
        lock(&self.responses).clear();
    }

    fn callbacks(&self) -> Callbacks {
        read_lock(&self.callbacks).clone()
    }

    fn emit_log_line(&self, line: &str) {
        debug!("device: {}", escape_log(line));
        if let Some(cb) = read_lock(&self.callbacks).on_log_line.clone() {
            cb(line);
        }
    }

    fn handle_from_radio(&self, msg: proto::FromRadio) {
        let Some(variant) = msg.payload_variant else {
            trace!("FromRadio without payload");
            return;
        };
        match variant {
            FromRadioVariant::Packet(packet) => self.handle_packet(packet),
            FromRadioVariant::MyInfo(info) => {
                debug!("My node number: {:08x}", info.my_node_num);
                write_lock(&self.cache).my_info = Some(info);
            }
            FromRadioVariant::NodeInfo(node) => {
                write_lock(&self.cache).nodes.insert(node.num, node.clone());
                if let Some(cb) = self.callbacks().on_node_info {
                    cb(&node);
                }
            }
            FromRadioVariant::Config(config) => self.merge_config(config),
            FromRadioVariant::ModuleConfig(config) => self.merge_module_config(config),
            FromRadioVariant::Channel(channel) => {
                write_lock(&self.cache).channels.insert(channel.index, channel);
            }
            FromRadioVariant::Metadata(meta) => {
                debug!("Firmware {}", meta.firmware_version);
                write_lock(&self.cache).metadata = Some(meta);
            }
            FromRadioVariant::ConfigCompleteId(id) => {
                debug!("Configuration complete (id={})", id);
                self.config_complete.send_replace(Some(id));
            }
            FromRadioVariant::Rebooted(_) => info!("Device rebooted"),
            FromRadioVariant::LogRecord(record) => self.emit_log_line(&record.message),
            FromRadioVariant::QueueStatus(q) => {
                debug!(
                    "Device queue: free={} max={} res={} packet={}",
                    q.free, q.maxlen, q.res, q.mesh_packet_id
                );
            }
        }
    }

    fn merge_config(&self, config: proto::Config) {
        use proto::config::PayloadVariant as C;
        let mut cache = write_lock(&self.cache);
        let local = &mut cache.local_config;
        match config.payload_variant {
            Some(C::Device(c)) => local.device = Some(c),
            Some(C::Position(c)) => local.position = Some(c),
            Some(C::Power(c)) => local.power = Some(c),
            Some(C::Network(c)) => local.network = Some(c),
            Some(C::Display(c)) => local.display = Some(c),
            Some(C::Lora(c)) => local.lora = Some(c),
            Some(C::Bluetooth(c)) => local.bluetooth = Some(c),
            None => {}
        }
    }

    fn merge_module_config(&self, config: proto::ModuleConfig) {
        use proto::module_config::PayloadVariant as M;
        let mut cache = write_lock(&self.cache);
        let local = &mut cache.module_config;
        match config.payload_variant {
            Some(M::Mqtt(c)) => local.mqtt = Some(c),
            Some(M::Serial(c)) => local.serial = Some(c),
            Some(M::ExternalNotification(c)) => local.external_notification = Some(c),
            Some(M::StoreForward(c)) => local.store_forward = Some(c),
            Some(M::RangeTest(c)) => local.range_test = Some(c),
            Some(M::Telemetry(c)) => local.telemetry = Some(c),
            Some(M::CannedMessage(c)) => local.canned_message = Some(c),
            Some(M::Audio(c)) => local.audio = Some(c),
            Some(M::RemoteHardware(c)) => local.remote_hardware = Some(c),
            Some(M::NeighborInfo(c)) => local.neighbor_info = Some(c),
            Some(M::AmbientLighting(c)) => local.ambient_lighting = Some(c),
            Some(M::DetectionSensor(c)) => local.detection_sensor = Some(c),
            Some(M::Paxcounter(c)) => local.paxcounter = Some(c),
            None => {}
        }
    }

    fn handle_packet(&self, packet: proto::MeshPacket) {
        self.counters.inc_messages_received();
        let callbacks = self.callbacks();
        if let Some(cb) = &callbacks.on_message {
            cb(&packet);
        }
        let Some(data) = packet_data(&packet) else {
            trace!("Encrypted packet id={} from {:08x}", packet.id, packet.from);
            return;
        };
        let port = proto::PortNum::try_from(data.portnum).unwrap_or(proto::PortNum::UnknownApp);
        match port {
            proto::PortNum::TextMessageApp => {
                let msg = TextMessage {
                    id: packet.id,
                    from: packet.from,
                    to: packet.to,
                    channel: packet.channel,
                    text: String::from_utf8_lossy(&data.payload).into_owned(),
                };
                debug!("Text from {:08x}: '{}'", msg.from, escape_log(&msg.text));
                if let Some(cb) = &callbacks.on_text {
                    cb(&msg);
                }
            }
            proto::PortNum::PositionApp => match proto::Position::decode(&data.payload[..]) {
                Ok(pos) => {
                    if let Some(node) = write_lock(&self.cache).nodes.get_mut(&packet.from) {
                        node.position = Some(pos.clone());
                    }
                    if let Some(cb) = &callbacks.on_position {
                        cb(packet.from, &pos);
                    }
                }
                Err(e) => self.decode_failed("position", e),
            },
            proto::PortNum::TelemetryApp => match proto::Telemetry::decode(&data.payload[..]) {
                Ok(t) => {
                    if let Some(proto::telemetry::Variant::DeviceMetrics(m)) = &t.variant {
                        if let Some(node) = write_lock(&self.cache).nodes.get_mut(&packet.from) {
                            node.device_metrics = Some(m.clone());
                        }
                    }
                    if let Some(cb) = &callbacks.on_telemetry {
                        cb(packet.from, &t);
                    }
                }
                Err(e) => self.decode_failed("telemetry", e),
            },
            proto::PortNum::NodeinfoApp => match proto::User::decode(&data.payload[..]) {
                Ok(user) => {
                    let node = {
                        let mut cache = write_lock(&self.cache);
                        let node = cache.nodes.entry(packet.from).or_insert_with(|| {
                            proto::NodeInfo {
                                num: packet.from,
                                ..Default::default()
                            }
                        });
                        node.user = Some(user);
                        node.last_heard = packet.rx_time;
                        node.clone()
                    };
                    if let Some(cb) = &callbacks.on_node_info {
                        cb(&node);
                    }
                }
                Err(e) => self.decode_failed("user", e),
            },
            proto::PortNum::RoutingApp => {
                if data.request_id != 0 && self.queue.message_acked(data.request_id) {
                    trace!("Ack for packet id={}", data.request_id);
                }
                if let Ok(routing) = proto::Routing::decode(&data.payload[..]) {
                    if let Some(proto::routing::Variant::ErrorReason(code)) = routing.variant {
                        if code != proto::routing::Error::None as i32 {
                            warn!(
                                "Delivery of packet id={} failed: {:?}",
                                data.request_id,
                                proto::routing::Error::try_from(code)
                            );
                        }
                    }
                }
            }
            proto::PortNum::AdminApp => match proto::AdminMessage::decode(&data.payload[..]) {
                Ok(msg) => self.resolve_admin(data.request_id, packet.id, msg),
                Err(e) => self.decode_failed("admin", e),
            },
            other => trace!("Ignoring packet on port {:?}", other),
        }
    }

    fn resolve_admin(&self, request_id: u32, packet_id: u32, msg: proto::AdminMessage) {
        let waiter = {
            let mut responses = lock(&self.responses);
            let by_request = if request_id != 0 {
                responses.remove(&request_id)
            } else {
                None
            };
            by_request.or_else(|| responses.remove(&packet_id))
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => debug!(
                "Unsolicited admin message (request_id={}, id={})",
                request_id, packet_id
            ),
        }
    }

    fn decode_failed(&self, what: &str, e: prost::DecodeError) {
        self.counters.inc_decode_errors();
        debug!("Failed to decode {} payload: {}", what, e);
    }
}

struct Dispatcher<'a> {
    shared: &'a Shared,
    lines: &'a mut LineAssembler,
}

impl FrameSink for Dispatcher<'_> {
    fn on_frame(&mut self, frame: Frame) {
        self.shared.counters.inc_frames_received();
        match frame.decode_from_radio() {
            Ok(msg) => self.shared.handle_from_radio(msg),
            Err(e) => {
                self.shared.counters.inc_decode_errors();
                debug!(
                    "Undecodable frame ({} bytes): {}\n{}",
                    frame.payload.len(),
                    e,
                    hex_dump(&frame.payload, 64)
                );
            }
        }
    }

    fn on_log_byte(&mut self, byte: u8) {
        if let Some(line) = self.lines.push(byte) {
            self.shared.emit_log_line(&line);
        }
    }

    fn on_error(&mut self, err: &FrameError) {
        debug!("Frame error on {}: {}", self.shared.device_path, err);
    }
}
