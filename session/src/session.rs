//! Session manager
//!
//! Owns the single connection to the vendor service:
//! - Login handshake on every open, heartbeat at the announced interval plus skew
//! - Request/response correlation by sequence, out-of-order safe
//! - Reconnection on abnormal close or refusal, at most one scheduled at a time
//! - Status reads de-duplicated through the expiring cache
//! - Pushes forwarded to subscribers as [`SessionEvent`]s
//!
//! Every connection gets a new epoch. Reader and heartbeat tasks carry the
//! epoch they were started for and stop acting once it is stale, which is how
//! old listeners are detached before a reconnect.

use crate::cache::ExpiringCache;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{
    generate_nonce, heartbeat_interval, parse_inbound, Action, DeviceStatus, DeviceUpdate,
    Inbound, Push, RelayPatch, ABNORMAL_CLOSE_CODE, APP_USER_AGENT, HEARTBEAT_PING,
    NORMAL_CLOSE_CODE, PROTOCOL_VERSION,
};
use crate::transport::{Connector, OutboundFrame, TransportEvent, WsConnector};
use crate::SessionConfig;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Pending request waiting for its response
type PendingTx = oneshot::Sender<SessionResult<Value>>;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
    Reconnecting,
}

/// Session event
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transport is up, login in progress
    Opened,
    /// Login accepted
    LoggedIn { heartbeat_secs: Option<u64> },
    /// Transport closed with the given code
    Closed { code: u16 },
    /// A reconnect was scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// Device pushed new parameters
    Device(DeviceUpdate),
    /// Device went online or offline
    Online { device_id: String, online: bool },
}

/// Handle to the vendor session
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state: RwLock<ConnectionState>,
    url: RwLock<Option<String>>,
    outbound: RwLock<Option<mpsc::Sender<OutboundFrame>>>,
    pending: Mutex<HashMap<u64, PendingTx>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_sequence: AtomicU64,
    /// Heartbeat interval from the last login, 0 when none
    heartbeat_secs: AtomicU64,
    reconnecting: AtomicBool,
    reconnect_attempts: AtomicU32,
    epoch: AtomicU64,
    cache: ExpiringCache<String, DeviceStatus>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Create a session using the given connector
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cache = ExpiringCache::new(config.status_ttl());
        cache.add_expiry_listener(|device_id: &String| {
            tracing::trace!("Cached status for {} expired", device_id);
        });

        Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                state: RwLock::new(ConnectionState::Closed),
                url: RwLock::new(None),
                outbound: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                last_sequence: AtomicU64::new(0),
                heartbeat_secs: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                cache,
                event_tx,
            }),
        }
    }

    /// Create a session over a WebSocket
    pub fn with_websocket(config: SessionConfig) -> Self {
        Self::new(config, Arc::new(WsConnector))
    }

    /// Get the session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Check if the transport is open
    pub async fn is_open(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    /// Heartbeat interval learned at the last login
    pub fn heartbeat_interval(&self) -> Option<u64> {
        match self.inner.heartbeat_secs.load(Ordering::SeqCst) {
            0 => None,
            secs => Some(secs),
        }
    }

    /// Reconnects scheduled since the last successful login
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Cached status for a device, if any
    pub fn cached_status(&self, device_id: &str) -> Option<DeviceStatus> {
        self.inner.cache.get(&device_id.to_string())
    }

    /// Drop the cached status for a device
    pub fn invalidate(&self, device_id: &str) {
        self.inner.cache.delete(&device_id.to_string());
    }

    /// Open the session and log in
    ///
    /// The URL is remembered for reconnects. A refused or failed connection
    /// schedules a reconnect before the error is returned.
    pub async fn open(&self, url: &str) -> SessionResult<()> {
        self.inner.open(url).await
    }

    /// Close the session with a normal close code; no reconnect follows
    pub async fn close(&self) -> SessionResult<()> {
        let inner = &self.inner;
        tracing::info!("Closing session");

        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.set_state(ConnectionState::Closing).await;

        let outbound = inner.outbound.read().await.clone();
        if let Some(tx) = outbound {
            let _ = tx.send(OutboundFrame::Close(NORMAL_CLOSE_CODE)).await;
        }

        inner.detach().await;
        inner.set_state(ConnectionState::Closed).await;
        let _ = inner.event_tx.send(SessionEvent::Closed {
            code: NORMAL_CLOSE_CODE,
        });
        Ok(())
    }

    /// Get device status, served from the cache when possible
    pub async fn get_status(&self, device_id: &str) -> SessionResult<DeviceStatus> {
        let inner = &self.inner;
        if let Some(status) = inner.cache.get(&device_id.to_string()) {
            tracing::trace!("Status cache hit for {}", device_id);
            return Ok(status);
        }

        inner.jitter().await;
        let body = inner
            .request(Action::Query {
                deviceid: device_id.to_string(),
                apikey: inner.config.api_key.clone(),
                user_agent: APP_USER_AGENT.to_string(),
                params: Vec::new(),
                ts: 0,
            })
            .await?;

        let status = DeviceStatus::from_response(device_id, &body);
        inner.cache.set(device_id.to_string(), status.clone());
        Ok(status)
    }

    /// Send a relay patch to a device
    ///
    /// When the socket is not open the update is retried once after the
    /// configured delay; any other failure is returned immediately.
    pub async fn update_status(&self, device_id: &str, patch: RelayPatch) -> SessionResult<()> {
        let inner = &self.inner;
        inner.jitter().await;

        let action = Action::Update {
            deviceid: device_id.to_string(),
            apikey: inner.config.api_key.clone(),
            self_apikey: inner.config.api_key.clone(),
            user_agent: APP_USER_AGENT.to_string(),
            params: patch,
            ts: 0,
        };

        match inner.request(action.clone()).await {
            Err(e) if e.is_not_open() => {
                let delay = inner.config.write_retry_delay();
                tracing::warn!(
                    "Session not open, retrying update for {} in {:?}",
                    device_id,
                    delay
                );
                sleep(delay).await;
                inner.request(action).await?;
            }
            result => {
                result?;
            }
        }

        inner.cache.delete(&device_id.to_string());
        Ok(())
    }
}

impl SessionInner {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn open(self: &Arc<Self>, url: &str) -> SessionResult<()> {
        *self.url.write().await = Some(url.to_string());
        self.set_state(ConnectionState::Opening).await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        // A live connection is torn down before it is replaced
        self.detach().await;

        let connection = match self.connector.connect(url).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("Failed to open session to {}: {}", url, e);
                if e.is_reconnectable() {
                    self.schedule_reconnect();
                } else {
                    self.set_state(ConnectionState::Closed).await;
                }
                return Err(e);
            }
        };

        *self.outbound.write().await = Some(connection.outbound);
        let reader = tokio::spawn(Self::reader_task(self.clone(), epoch, connection.inbound));
        self.tasks.lock().await.push(reader);

        self.set_state(ConnectionState::Open).await;
        let _ = self.event_tx.send(SessionEvent::Opened);
        tracing::info!("Session opened to {}", url);

        match self.login(epoch).await {
            Ok(()) => Ok(()),
            Err(e @ SessionError::Remote { .. }) => {
                tracing::error!("Session login rejected: {}", e);
                self.epoch.fetch_add(1, Ordering::SeqCst);
                self.detach().await;
                self.set_state(ConnectionState::Closed).await;
                Err(e)
            }
            Err(e) => {
                tracing::warn!("Session login failed: {}", e);
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    async fn login(self: &Arc<Self>, epoch: u64) -> SessionResult<()> {
        let response = self
            .request(Action::UserOnline {
                version: PROTOCOL_VERSION,
                ts: Utc::now().timestamp(),
                at: self.config.access_token.clone(),
                user_agent: APP_USER_AGENT.to_string(),
                apikey: self.config.api_key.clone(),
                appid: self.config.app_id.clone(),
                nonce: generate_nonce(),
            })
            .await?;

        let heartbeat_secs = heartbeat_interval(&response);
        self.heartbeat_secs
            .store(heartbeat_secs.unwrap_or(0), Ordering::SeqCst);
        if let Some(secs) = heartbeat_secs {
            let period = self.config.heartbeat_period(secs);
            let heartbeat = tokio::spawn(Self::heartbeat_task(self.clone(), epoch, period));
            self.tasks.lock().await.push(heartbeat);
        }

        self.reconnect_attempts.store(0, Ordering::SeqCst);
        tracing::info!("Session logged in (heartbeat {:?}s)", heartbeat_secs);
        let _ = self.event_tx.send(SessionEvent::LoggedIn { heartbeat_secs });
        Ok(())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Heartbeat task - sends keep-alives until its epoch is superseded
    async fn heartbeat_task(inner: Arc<Self>, epoch: u64, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if !inner.is_current(epoch) {
                return;
            }
            let outbound = inner.outbound.read().await.clone();
            let Some(tx) = outbound else {
                return;
            };
            tracing::trace!("Sending session heartbeat");
            if tx
                .send(OutboundFrame::Text(HEARTBEAT_PING.to_string()))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    /// Reader task - dispatches transport events for one epoch
    async fn reader_task(inner: Arc<Self>, epoch: u64, mut inbound: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            if !inner.is_current(epoch) {
                return;
            }
            match event {
                TransportEvent::Message(text) => inner.handle_message(&text).await,
                TransportEvent::Closed { code } => {
                    inner.handle_close(code).await;
                    return;
                }
                TransportEvent::Error { message, refused } => {
                    if refused {
                        tracing::warn!("Session connection refused: {}", message);
                        inner.schedule_reconnect();
                        return;
                    }
                    tracing::warn!("Session transport error: {}", message);
                }
            }
        }

        if inner.is_current(epoch) {
            inner.handle_close(ABNORMAL_CLOSE_CODE).await;
        }
    }

    async fn handle_message(&self, text: &str) {
        let message = match parse_inbound(text) {
            Ok(Inbound::Pong) => {
                tracing::trace!("Session heartbeat acknowledged");
                return;
            }
            Ok(Inbound::Message(message)) => message,
            Err(e) => {
                tracing::debug!("Dropping unparseable session message: {}", e);
                return;
            }
        };

        if let Some(sequence) = message.sequence {
            let waiter = self.pending.lock().await.remove(&sequence);
            if let Some(tx) = waiter {
                let _ = tx.send(message.into_result());
                return;
            }
        }

        match message.push {
            Some(Push::Device(update)) => {
                self.cache.delete(&update.device_id);
                tracing::debug!("Device {} pushed an update", update.device_id);
                let _ = self.event_tx.send(SessionEvent::Device(update));
            }
            Some(Push::System { device_id, online }) => {
                self.cache.delete(&device_id);
                if let Some(online) = online {
                    tracing::info!(
                        "Device {} is now {}",
                        device_id,
                        if online { "online" } else { "offline" }
                    );
                    let _ = self.event_tx.send(SessionEvent::Online { device_id, online });
                }
            }
            None => {
                tracing::debug!(
                    "Dropping unmatched session message (sequence {:?})",
                    message.sequence
                );
            }
        }
    }

    async fn handle_close(self: &Arc<Self>, code: u16) {
        let _ = self.event_tx.send(SessionEvent::Closed { code });

        if code == NORMAL_CLOSE_CODE {
            tracing::info!("Session closed normally");
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            // Runs outside the reader, which detach aborts
            let inner = self.clone();
            tokio::spawn(async move {
                inner.detach().await;
                if inner.is_current(epoch) {
                    inner.set_state(ConnectionState::Closed).await;
                }
            });
            return;
        }

        tracing::warn!("Session closed abnormally with code {}", code);
        self.schedule_reconnect();
    }

    /// Schedule a reconnect unless one is already pending
    ///
    /// Returns whether this call scheduled it.
    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Reconnect already scheduled");
            return false;
        }

        // Listeners of the dead connection stop here
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.config.reconnection.calculate_delay(attempt);
        let inner = self.clone();

        tokio::spawn(async move {
            inner.detach().await;
            if inner.is_current(epoch) {
                inner.set_state(ConnectionState::Reconnecting).await;
            }
            let _ = inner
                .event_tx
                .send(SessionEvent::Reconnecting { attempt, delay });
            tracing::info!("Reconnecting session in {:?} (attempt {})", delay, attempt);

            sleep(delay).await;
            inner.reconnecting.store(false, Ordering::SeqCst);

            // close() or a manual open() moved the epoch on
            if !inner.is_current(epoch) {
                tracing::info!("Scheduled reconnect superseded");
                return;
            }
            let url = inner.url.read().await.clone();
            let Some(url) = url else {
                return;
            };
            if let Err(e) = inner.open(&url).await {
                tracing::warn!("Reconnection attempt {} failed: {}", attempt, e);
            }
        });

        true
    }

    /// Stop tasks, drop the writer and fail every pending request
    async fn detach(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        *self.outbound.write().await = None;

        let pending: Vec<(u64, PendingTx)> = self.pending.lock().await.drain().collect();
        for (sequence, tx) in pending {
            let _ = tx.send(Err(SessionError::ConnectionClosed { sequence }));
        }
    }

    /// Next sequence: the millisecond clock, bumped to stay strictly increasing
    fn next_sequence(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut current = self.last_sequence.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self.last_sequence.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    async fn jitter(&self) {
        let ms = rand::thread_rng().gen_range(self.config.jitter_range_ms());
        sleep(Duration::from_millis(ms)).await;
    }

    async fn request(&self, action: Action) -> SessionResult<Value> {
        let sequence = self.next_sequence();
        let frame = action.to_frame(sequence)?;

        let outbound = self.outbound.read().await.clone();
        let Some(outbound) = outbound else {
            return Err(SessionError::NotConnected);
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(sequence, tx);

        if let Err(e) = outbound.send(OutboundFrame::Text(frame)).await {
            self.pending.lock().await.remove(&sequence);
            return Err(SessionError::ChannelClosed(format!(
                "Failed to send '{}': {}",
                action.name(),
                e
            )));
        }

        let outcome = match self.config.request_timeout() {
            Some(limit) => match timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.remove(&sequence);
                    return Err(SessionError::RequestTimeout {
                        action: action.name().to_string(),
                        sequence,
                        duration: limit,
                    });
                }
            },
            None => rx.await,
        };

        outcome.map_err(|_| SessionError::ConnectionClosed { sequence })?
    }
}
