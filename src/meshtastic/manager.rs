//! Connection supervision.
//!
//! [`ConnectionManager`] wraps a [`MeshLink`] with retrying connects and sends and an
//! independent reconnect handler that kicks in whenever the link reports that the
//! stream went away. [`HeartbeatManager`] keeps the serial session alive, and
//! [`RobustClient`] composes both with a [`StateTracker`] fed from the link's state
//! broadcasts.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::discovery::Discovery;
use super::error::{MeshError, Result};
use super::lock;
use super::state::{DeviceState, StateStats, StateTracker, StateTransition};
use super::stream::{DisconnectCallback, StreamConnection, StreamSettings};
use super::transport::{SerialSettings, Transport};
use crate::metrics::ConnectionStats;
use crate::protobuf::meshtastic_generated as proto;

/// What the manager needs from a connection.
#[async_trait]
pub trait MeshLink: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    /// Reopen the physical port and attach it, ready for `connect`.
    async fn reopen(&self) -> Result<()>;
    fn send_message(&self, packet: proto::MeshPacket) -> Result<u32>;
    fn send_text(&self, text: &str, destination: u32, channel: u32) -> Result<u32>;
    fn send_heartbeat(&self) -> Result<()>;
    fn is_connected(&self) -> bool;
    fn state(&self) -> DeviceState;
    fn set_state(&self, state: DeviceState);
    fn stats(&self) -> ConnectionStats;
    fn set_on_disconnect(&self, cb: DisconnectCallback);
    fn subscribe_state_changes(&self) -> broadcast::Receiver<StateTransition>;
    /// The underlying stream connection, when there is one.
    fn stream(&self) -> Option<&StreamConnection> {
        None
    }
}

pub type PortOpener = Arc<dyn Fn() -> Result<Box<dyn Transport>> + Send + Sync>;

/// A [`StreamConnection`] plus the means to reopen its port.
pub struct SerialLink {
    conn: StreamConnection,
    opener: PortOpener,
}

impl SerialLink {
    pub fn new(conn: StreamConnection, opener: PortOpener) -> Self {
        Self { conn, opener }
    }

    /// Open the serial port described by `serial` and wrap it.
    #[cfg(feature = "serial")]
    pub async fn open(serial: SerialSettings, stream: StreamSettings) -> Result<Self> {
        use super::transport::SerialTransport;
        let settings = serial.clone();
        let opener: PortOpener = Arc::new(move || {
            SerialTransport::open(&settings).map(|t| Box::new(t) as Box<dyn Transport>)
        });
        let transport = open_blocking(opener.clone()).await?;
        Ok(Self::new(
            StreamConnection::new(transport, serial.port, stream),
            opener,
        ))
    }

    pub fn connection(&self) -> &StreamConnection {
        &self.conn
    }
}

async fn open_blocking(opener: PortOpener) -> Result<Box<dyn Transport>> {
    tokio::task::spawn_blocking(move || opener())
        .await
        .map_err(|e| MeshError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

#[async_trait]
impl MeshLink for SerialLink {
    async fn connect(&self) -> Result<()> {
        self.conn.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.conn.disconnect().await
    }

    async fn close(&self) -> Result<()> {
        self.conn.close().await
    }

    async fn reopen(&self) -> Result<()> {
        let transport = open_blocking(self.opener.clone())
            .await
            .map_err(|e| e.context("failed to reopen serial port"))?;
        self.conn.set_transport(transport);
        Ok(())
    }

    fn send_message(&self, packet: proto::MeshPacket) -> Result<u32> {
        self.conn.send_message(packet)
    }

    fn send_text(&self, text: &str, destination: u32, channel: u32) -> Result<u32> {
        self.conn.send_text(text, destination, channel)
    }

    fn send_heartbeat(&self) -> Result<()> {
        self.conn.send_heartbeat()
    }

    fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    fn state(&self) -> DeviceState {
        self.conn.state()
    }

    fn set_state(&self, state: DeviceState) {
        self.conn.set_state(state);
    }

    fn stats(&self) -> ConnectionStats {
        self.conn.stats()
    }

    fn set_on_disconnect(&self, cb: DisconnectCallback) {
        self.conn.set_on_disconnect(cb);
    }

    fn subscribe_state_changes(&self) -> broadcast::Receiver<StateTransition> {
        self.conn.subscribe_state_changes()
    }

    fn stream(&self) -> Option<&StreamConnection> {
        Some(&self.conn)
    }
}

/// Connect and send retry behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub send_attempts: u32,
    /// Fixed pause between send attempts.
    pub send_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            send_attempts: 5,
            send_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Pauses taken between connect attempts, in order.
    pub fn delays(&self) -> Vec<Duration> {
        let mut out = Vec::new();
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..self.max_attempts.max(1) {
            out.push(delay);
            delay = delay.mul_f64(self.multiplier).min(self.max_delay);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            delay: Duration::from_secs(2),
            multiplier: 1.5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Pause before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay
            .mul_f64(self.multiplier * attempt as f64)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: DeviceState,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Default)]
struct StatusInner {
    attempts: u32,
    last_attempt: Option<DateTime<Utc>>,
    connected_at: Option<DateTime<Utc>>,
    disconnected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    reconnect_attempts: u32,
}

struct ManagerInner {
    link: Arc<dyn MeshLink>,
    retry: RetryPolicy,
    reconnect: ReconnectPolicy,
    status: Mutex<StatusInner>,
    shutdown: Mutex<CancellationToken>,
    disconnect_tx: mpsc::UnboundedSender<String>,
    disconnects: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(link: Arc<dyn MeshLink>, retry: RetryPolicy, reconnect: ReconnectPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let link_tx = tx.clone();
        // Runs on the reader thread: only hand the cause over.
        link.set_on_disconnect(Arc::new(move |cause: &MeshError| {
            let _ = link_tx.send(cause.to_string());
        }));
        Self {
            inner: Arc::new(ManagerInner {
                link,
                retry,
                reconnect,
                status: Mutex::new(StatusInner::default()),
                shutdown: Mutex::new(CancellationToken::new()),
                disconnect_tx: tx,
                disconnects: Arc::new(tokio::sync::Mutex::new(rx)),
                handler: Mutex::new(None),
            }),
        }
    }

    pub fn link(&self) -> &Arc<dyn MeshLink> {
        &self.inner.link
    }

    /// Connect with exponential backoff between attempts.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let max = inner.retry.max_attempts.max(1);
        let mut delays = inner.retry.delays().into_iter();
        let mut errors = Vec::new();
        lock(&inner.status).last_attempt = Some(Utc::now());

        for attempt in 1..=max {
            lock(&inner.status).attempts = attempt;
            info!("Connection attempt {}/{}", attempt, max);
            match inner.link.connect().await {
                Ok(()) => {
                    {
                        let mut st = lock(&inner.status);
                        st.connected_at = Some(Utc::now());
                        st.last_error = None;
                        st.reconnect_attempts = 0;
                    }
                    info!("Connected on attempt {}", attempt);
                    self.ensure_reconnect_handler();
                    return Ok(());
                }
                Err(e) => {
                    let msg = e.to_string();
                    lock(&inner.status).last_error = Some(msg.clone());
                    errors.push(msg);
                    let Some(delay) = delays.next() else { break };
                    warn!(
                        "Connection attempt {} failed: {}; retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(MeshError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        inner.link.set_state(DeviceState::Error);
        Err(MeshError::RetriesExhausted {
            operation: "connect",
            attempts: max,
            errors,
        })
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.stop_reconnect_handler().await;
        lock(&self.inner.status).disconnected_at = Some(Utc::now());
        self.inner.link.disconnect().await
    }

    pub async fn close(&self) -> Result<()> {
        self.stop_reconnect_handler().await;
        lock(&self.inner.status).disconnected_at = Some(Utc::now());
        self.inner.link.close().await
    }

    pub async fn send_message_with_retry(&self, packet: proto::MeshPacket) -> Result<u32> {
        let link = &self.inner.link;
        self.retry_send("send message", || link.send_message(packet.clone()))
            .await
    }

    pub async fn send_text_with_retry(
        &self,
        text: &str,
        destination: u32,
        channel: u32,
    ) -> Result<u32> {
        let link = &self.inner.link;
        self.retry_send("send text", || link.send_text(text, destination, channel))
            .await
    }

    async fn retry_send<F>(&self, operation: &'static str, mut send: F) -> Result<u32>
    where
        F: FnMut() -> Result<u32>,
    {
        let attempts = self.inner.retry.send_attempts.max(1);
        let mut errors = Vec::new();
        for attempt in 1..=attempts {
            match send() {
                Ok(id) => return Ok(id),
                Err(e) => {
                    errors.push(e.to_string());
                    if attempt < attempts {
                        warn!("Failed to {} (attempt {}): {}", operation, attempt, e);
                        tokio::time::sleep(self.inner.retry.send_delay).await;
                    }
                }
            }
        }
        Err(MeshError::RetriesExhausted {
            operation,
            attempts,
            errors,
        })
    }

    /// Treat a connected link as lost, e.g. because its port vanished, and hand it to
    /// the reconnect handler. Ignored when the link is not connected.
    pub fn report_disconnect(&self, cause: &MeshError) {
        if !self.inner.link.is_connected() {
            return;
        }
        self.inner.link.set_state(DeviceState::Disconnected);
        let _ = self.inner.disconnect_tx.send(cause.to_string());
    }

    /// Give the reconnect handler its full attempt budget again.
    pub fn reset_reconnect_attempts(&self) {
        lock(&self.inner.status).reconnect_attempts = 0;
    }

    pub fn status(&self) -> ConnectionStatus {
        let st = lock(&self.inner.status);
        ConnectionStatus {
            state: self.inner.link.state(),
            attempts: st.attempts,
            last_attempt: st.last_attempt,
            connected_at: st.connected_at,
            disconnected_at: st.disconnected_at,
            last_error: st.last_error.clone(),
            reconnect_attempts: st.reconnect_attempts,
        }
    }

    fn ensure_reconnect_handler(&self) {
        if !self.inner.reconnect.enabled {
            return;
        }
        let mut handler = lock(&self.inner.handler);
        if handler.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let token = lock(&self.inner.shutdown).clone();
        let inner = self.inner.clone();
        *handler = Some(tokio::spawn(async move {
            let rx = inner.disconnects.clone();
            let mut rx = rx.lock().await;
            loop {
                let cause = tokio::select! {
                    _ = token.cancelled() => break,
                    cause = rx.recv() => match cause {
                        Some(c) => c,
                        None => break,
                    },
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = inner.reconnect(cause, &token) => {}
                }
            }
            debug!("Reconnect handler stopped");
        }));
    }

    async fn stop_reconnect_handler(&self) {
        {
            let mut token = lock(&self.inner.shutdown);
            token.cancel();
            *token = CancellationToken::new();
        }
        let handle = lock(&self.inner.handler).take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }
}

impl ManagerInner {
    async fn reconnect(&self, cause: String, token: &CancellationToken) {
        // Causes queued while no handler ran may predate the current session.
        if self.link.is_connected() {
            debug!("Ignoring stale disconnect ({})", cause);
            return;
        }
        warn!("Device disconnected ({}), reconnecting", cause);
        {
            let mut st = lock(&self.status);
            st.disconnected_at = Some(Utc::now());
            st.last_error = Some(cause);
        }
        self.link.set_state(DeviceState::Reconnecting);

        loop {
            let attempt = {
                let mut st = lock(&self.status);
                if st.reconnect_attempts >= self.reconnect.max_attempts {
                    None
                } else {
                    st.reconnect_attempts += 1;
                    Some(st.reconnect_attempts)
                }
            };
            let Some(attempt) = attempt else {
                error!(
                    "Giving up after {} reconnect attempts",
                    self.reconnect.max_attempts
                );
                self.link.set_state(DeviceState::Error);
                return;
            };

            let delay = self.reconnect.delay_for(attempt);
            info!(
                "Reconnect attempt {}/{} in {:?}",
                attempt, self.reconnect.max_attempts, delay
            );
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if let Err(e) = self.link.reopen().await {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                lock(&self.status).last_error = Some(e.to_string());
                self.link.set_state(DeviceState::Reconnecting);
                continue;
            }
            match self.link.connect().await {
                Ok(()) => {
                    let mut st = lock(&self.status);
                    st.reconnect_attempts = 0;
                    st.connected_at = Some(Utc::now());
                    st.last_error = None;
                    info!("Reconnected after {} attempt(s)", attempt);
                    return;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    lock(&self.status).last_error = Some(e.to_string());
                    self.link.set_state(DeviceState::Reconnecting);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStats {
    pub active: bool,
    pub interval: Duration,
    pub timeout: Duration,
    pub last_sent: Option<DateTime<Utc>>,
    pub heartbeats_sent: u64,
    pub missed_heartbeats: u64,
}

#[derive(Debug, Default)]
struct HeartbeatCounters {
    last_sent: Option<DateTime<Utc>>,
    sent: u64,
    missed: u64,
}

/// Periodic keep-alive while the link is connected.
pub struct HeartbeatManager {
    link: Arc<dyn MeshLink>,
    interval: Duration,
    timeout: Duration,
    counters: Arc<Mutex<HeartbeatCounters>>,
    running: Mutex<Option<CancellationToken>>,
}

impl HeartbeatManager {
    pub fn new(link: Arc<dyn MeshLink>, interval: Duration, timeout: Duration) -> Self {
        Self {
            link,
            interval,
            timeout,
            counters: Arc::new(Mutex::new(HeartbeatCounters::default())),
            running: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());
        let link = self.link.clone();
        let counters = self.counters.clone();
        let (interval, timeout) = (self.interval, self.timeout);
        info!("Heartbeat every {:?}", interval);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        if !link.is_connected() {
                            continue;
                        }
                        let l = link.clone();
                        let sent = tokio::time::timeout(
                            timeout,
                            tokio::task::spawn_blocking(move || l.send_heartbeat()),
                        )
                        .await;
                        let mut c = lock(&counters);
                        match sent {
                            Ok(Ok(Ok(()))) => {
                                c.sent += 1;
                                c.last_sent = Some(Utc::now());
                                debug!("Heartbeat sent");
                            }
                            Ok(Ok(Err(e))) => {
                                c.missed += 1;
                                warn!("Failed to send heartbeat: {}", e);
                            }
                            Ok(Err(e)) => {
                                c.missed += 1;
                                warn!("Heartbeat task failed: {}", e);
                            }
                            Err(_) => {
                                c.missed += 1;
                                warn!("Heartbeat timed out after {:?}", timeout);
                            }
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(token) = lock(&self.running).take() {
            token.cancel();
            debug!("Heartbeat stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn stats(&self) -> HeartbeatStats {
        let c = lock(&self.counters);
        HeartbeatStats {
            active: self.is_active(),
            interval: self.interval,
            timeout: self.timeout,
            last_sent: c.last_sent,
            heartbeats_sent: c.sent,
            missed_heartbeats: c.missed,
        }
    }
}

impl Drop for HeartbeatManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub serial: SerialSettings,
    pub stream: StreamSettings,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            stream: StreamSettings {
                heartbeat_interval: None,
                ..StreamSettings::default()
            },
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_enabled: true,
            heartbeat_interval: Duration::from_secs(300),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatistics {
    pub connection: ConnectionStats,
    pub status: ConnectionStatus,
    pub state: StateStats,
    pub heartbeat: HeartbeatStats,
}

/// Manager, heartbeat and state tracking over one link.
pub struct RobustClient {
    manager: ConnectionManager,
    heartbeat: HeartbeatManager,
    tracker: Arc<Mutex<StateTracker>>,
    tracker_task: JoinHandle<()>,
    heartbeat_enabled: bool,
    device_watch: Mutex<Option<CancellationToken>>,
}

impl RobustClient {
    /// Must be called from within a Tokio runtime.
    pub fn new(link: Arc<dyn MeshLink>, settings: &ClientSettings) -> Self {
        let tracker = Arc::new(Mutex::new(StateTracker::new()));
        let mut rx = link.subscribe_state_changes();
        let t = tracker.clone();
        let tracker_task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(transition) => lock(&t).record(transition),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("State tracker skipped {} transitions", n)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self {
            manager: ConnectionManager::new(
                link.clone(),
                settings.retry.clone(),
                settings.reconnect.clone(),
            ),
            heartbeat: HeartbeatManager::new(
                link,
                settings.heartbeat_interval,
                settings.heartbeat_timeout,
            ),
            tracker,
            tracker_task,
            heartbeat_enabled: settings.heartbeat_enabled,
            device_watch: Mutex::new(None),
        }
    }

    /// Open the configured serial port and build a client around it.
    #[cfg(feature = "serial")]
    pub async fn open(settings: &ClientSettings) -> Result<Self> {
        let link = SerialLink::open(settings.serial.clone(), settings.stream.clone()).await?;
        Ok(Self::new(Arc::new(link), settings))
    }

    /// Find the best-ranked radio, open it and connect.
    #[cfg(feature = "serial")]
    pub async fn auto_discover_and_connect(
        discovery: super::discovery::DiscoveryConfig,
        mut settings: ClientSettings,
    ) -> Result<Self> {
        let best = tokio::task::spawn_blocking(move || {
            Discovery::system(discovery).find_best_port()
        })
        .await
        .map_err(|e| MeshError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .map_err(|e| e.context("failed to discover Meshtastic device"))?;
        settings.serial.port = best.name.clone();

        let client = Self::open(&settings)
            .await
            .map_err(|e| e.context("failed to open discovered device"))?;
        if let Err(e) = client.connect(&CancellationToken::new()).await {
            let _ = client.close().await;
            return Err(e.context("failed to connect"));
        }
        Ok(client)
    }

    pub fn link(&self) -> &Arc<dyn MeshLink> {
        self.manager.link()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        self.manager.connect(cancel).await?;
        if self.heartbeat_enabled {
            self.heartbeat.start();
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.stop_device_watch();
        self.heartbeat.stop();
        self.manager.disconnect().await
    }

    pub async fn send_message(&self, packet: proto::MeshPacket) -> Result<u32> {
        self.manager.send_message_with_retry(packet).await
    }

    pub async fn send_text(&self, text: &str, destination: u32, channel: u32) -> Result<u32> {
        self.manager
            .send_text_with_retry(text, destination, channel)
            .await
    }

    /// Poll the port enumeration every `interval` and hand the link to the reconnect
    /// handler as soon as `port` disappears. Replaces any earlier watch.
    pub fn watch_device(&self, discovery: Arc<Discovery>, port: String, interval: Duration) {
        let token = CancellationToken::new();
        if let Some(old) = lock(&self.device_watch).replace(token.clone()) {
            old.cancel();
        }
        let manager = self.manager.clone();
        tokio::spawn(async move {
            discovery
                .monitor_device_connection(&port, interval, &token, |present| {
                    if present {
                        debug!("Device {} present", port);
                    } else {
                        warn!("Device {} disappeared", port);
                        manager.report_disconnect(&MeshError::PortNotFound(port.clone()));
                    }
                })
                .await;
        });
    }

    fn stop_device_watch(&self) {
        if let Some(token) = lock(&self.device_watch).take() {
            token.cancel();
        }
    }

    pub fn start_heartbeat(&self) {
        self.heartbeat.start();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    pub fn state_history(&self) -> Vec<StateTransition> {
        lock(&self.tracker).history()
    }

    pub fn statistics(&self) -> ClientStatistics {
        ClientStatistics {
            connection: self.link().stats(),
            status: self.manager.status(),
            state: lock(&self.tracker).stats(),
            heartbeat: self.heartbeat.stats(),
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.stop_device_watch();
        self.heartbeat.stop();
        self.manager.close().await
    }
}

impl Drop for RobustClient {
    fn drop(&mut self) {
        self.stop_device_watch();
        self.tracker_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_delays_grow_and_cap() {
        let p = RetryPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            ..RetryPolicy::default()
        };
        let d: Vec<u64> = p.delays().iter().map(|d| d.as_secs()).collect();
        assert_eq!(d, vec![4, 8, 16, 30, 30]);
    }

    #[test]
    fn reconnect_delay_is_linear_and_capped() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(3));
        assert_eq!(p.delay_for(2), Duration::from_secs(6));
        assert_eq!(p.delay_for(10), Duration::from_secs(30));
    }
}
