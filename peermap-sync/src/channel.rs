//! The sync channel: one STOMP session with the broker per activation.
//!
//! ## State machine
//!
//! ```text
//!                activate(peer_id)
//!  Disconnected ───────────────────► Connecting ◄──────────────┐
//!       ▲                               │                      │
//!       │                     CONNECTED │                      │ reconnect delay
//!       │                     + SUBSCRIBE                      │ (unbounded retries)
//!       │                               ▼                      │
//!       │ deactivate()              Connected ──────────► Reconnecting
//!       └────────────────────────── (any state)  transport error,
//!                                                ERROR frame,
//!                                                heartbeat timeout
//! ```
//!
//! Publishing is only accepted in `Connected`; anything else is dropped on
//! the floor. Inbound MESSAGE bodies go through
//! [`SyncChannel::on_inbound_message`], which never fails: malformed bodies
//! are logged and discarded, and updates carrying the local peer's own id
//! are always suppressed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{ConfigError, SyncConfig};
use crate::frame::{Command, Frame, FrameDecoder, FrameError, HeartBeat, Incoming, NegotiatedHeartBeat};
use crate::identity::PeerId;
use crate::position::{epoch_millis, Position};
use crate::protocol::LocationUpdateMessage;
use crate::registry::{PeerRegistry, RegistryView};
use crate::transport::{Connection, Connector, TransportError, TransportEvent};

/// Subscription id used for the broadcast topic on every connection.
pub const SUBSCRIPTION_ID: &str = "sub-0";

/// How long `deactivate` waits for the connection task to say goodbye.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Why a broker link ended.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Malformed frame from broker: {0}")]
    Frame(#[from] FrameError),
    #[error("Broker error: {0}")]
    Broker(String),
    #[error("Unexpected {0:?} frame during handshake")]
    UnexpectedFrame(Command),
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("No heartbeat from broker for {0:?}")]
    HeartbeatTimeout(Duration),
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Stored in the registry
    Applied,
    /// Carried the local peer's own id
    SelfEcho,
    /// Failed to parse or validate
    Malformed,
    /// No active session
    Inactive,
    /// The session ended while the message was in flight
    Stale,
}

/// Channel counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub published: u64,
    pub publish_dropped: u64,
    pub inbound_applied: u64,
    pub inbound_self_echo: u64,
    pub inbound_malformed: u64,
    pub connect_attempts: u64,
    pub links_lost: u64,
}

#[derive(Default)]
struct AtomicChannelStats {
    published: AtomicU64,
    publish_dropped: AtomicU64,
    inbound_applied: AtomicU64,
    inbound_self_echo: AtomicU64,
    inbound_malformed: AtomicU64,
    connect_attempts: AtomicU64,
    links_lost: AtomicU64,
}

impl AtomicChannelStats {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            published: self.published.load(Ordering::Relaxed),
            publish_dropped: self.publish_dropped.load(Ordering::Relaxed),
            inbound_applied: self.inbound_applied.load(Ordering::Relaxed),
            inbound_self_echo: self.inbound_self_echo.load(Ordering::Relaxed),
            inbound_malformed: self.inbound_malformed.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            links_lost: self.links_lost.load(Ordering::Relaxed),
        }
    }
}

/// Identity of one activation.
#[derive(Debug, Clone)]
struct Session {
    local_id: PeerId,
    /// Registry epoch captured at activation
    epoch: u64,
}

/// State shared between the owner, publishers and the connection task.
struct Shared {
    config: SyncConfig,
    registry: PeerRegistry,
    state: watch::Sender<ConnectionState>,
    session: RwLock<Option<Session>>,
    /// Writer queue of the live connection, present only while Connected
    outbound: RwLock<Option<mpsc::Sender<String>>>,
    stats: AtomicChannelStats,
}

struct Driver {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

enum LinkExit {
    Shutdown,
    Lost(LinkError),
}

/// An established STOMP link.
struct Link {
    conn: Connection,
    decoder: FrameDecoder,
    heart_beat: NegotiatedHeartBeat,
}

/// Owns the broker connection and the peer registry for one session.
pub struct SyncChannel<C: Connector> {
    shared: Arc<Shared>,
    connector: Arc<C>,
    driver: Option<Driver>,
}

impl<C: Connector> SyncChannel<C> {
    /// Create an inactive channel. The config is validated up front.
    pub fn new(config: SyncConfig, connector: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry: PeerRegistry::new(),
                state,
                session: RwLock::new(None),
                outbound: RwLock::new(None),
                stats: AtomicChannelStats::default(),
            }),
            connector: Arc::new(connector),
            driver: None,
        })
    }

    /// Start connecting as `peer_id`.
    ///
    /// Returns `false` without doing anything if a session is already
    /// running (Connecting, Connected or Reconnecting).
    pub async fn activate(&mut self, peer_id: PeerId) -> bool {
        if let Some(driver) = &self.driver {
            if !driver.handle.is_finished() {
                log::debug!("activate({peer_id}) ignored: session already running");
                return false;
            }
        }

        let session = Session {
            local_id: peer_id,
            epoch: self.shared.registry.epoch().await,
        };
        log::info!("Activating sync channel as {}", session.local_id);
        *self.shared.session.write().await = Some(session.clone());
        self.shared.set_state(ConnectionState::Connecting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            self.shared
                .clone()
                .run(self.connector.clone(), session, shutdown_rx),
        );
        self.driver = Some(Driver {
            shutdown: shutdown_tx,
            handle,
        });
        true
    }

    /// Tear the session down: close the link, cancel retry timers, clear
    /// the registry. Returns `false` if there was nothing to tear down.
    pub async fn deactivate(&mut self) -> bool {
        let Some(driver) = self.driver.take() else {
            return false;
        };
        let _ = driver.shutdown.send(true);
        let mut handle = driver.handle;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
            log::warn!("Connection task did not stop in {SHUTDOWN_GRACE:?}, aborting");
            handle.abort();
        }

        *self.shared.session.write().await = None;
        *self.shared.outbound.write().await = None;
        self.shared.registry.clear().await;
        self.shared.set_state(ConnectionState::Disconnected);
        log::info!("Sync channel deactivated");
        true
    }

    /// Publish the local position. Dropped unless Connected.
    pub async fn publish(&self, position: &Position) -> bool {
        self.shared.publish(position).await
    }

    /// Handle one raw MESSAGE body from the broadcast topic.
    pub async fn on_inbound_message(&self, raw: &str) -> InboundOutcome {
        self.shared.handle_inbound(raw).await
    }

    /// Cloneable publishing handle for position feeds.
    pub fn publisher(&self) -> Publisher {
        Publisher {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Read-only registry handle for the rendering layer.
    pub fn registry(&self) -> RegistryView {
        self.shared.registry.view()
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Local id of the running session.
    pub async fn local_id(&self) -> Option<PeerId> {
        self.shared
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.local_id.clone())
    }

    pub fn is_active(&self) -> bool {
        self.driver
            .as_ref()
            .is_some_and(|d| !d.handle.is_finished())
    }
}

impl<C: Connector> Drop for SyncChannel<C> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.shutdown.send(true);
            driver.handle.abort();
            // Surviving publishers must not keep the writer queue open.
            if let Ok(mut outbound) = self.shared.outbound.try_write() {
                *outbound = None;
            }
            if let Ok(mut session) = self.shared.session.try_write() {
                *session = None;
            }
            self.shared.registry.try_clear();
            self.shared.set_state(ConnectionState::Disconnected);
        }
    }
}

/// Publishing half of a [`SyncChannel`].
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
}

impl Publisher {
    pub async fn publish(&self, position: &Position) -> bool {
        self.shared.publish(position).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            log::debug!("Connection state -> {next:?}");
        }
    }

    async fn publish(&self, position: &Position) -> bool {
        if *self.state.borrow() != ConnectionState::Connected {
            log::trace!("Dropping position update: not connected");
            self.stats.publish_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Some(local_id) = self.session.read().await.as_ref().map(|s| s.local_id.clone()) else {
            self.stats.publish_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let Some(tx) = self.outbound.read().await.clone() else {
            self.stats.publish_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let msg = LocationUpdateMessage::from_position(&local_id, position, self.config.include_timestamp);
        let body = match msg.encode() {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Failed to encode position update: {e}");
                self.stats.publish_dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        let frame = Frame::send_json(&self.config.publish_destination, body);

        match tx.try_send(frame.encode()) {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::debug!("Dropping position update: {e}");
                self.stats.publish_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    async fn handle_inbound(&self, raw: &str) -> InboundOutcome {
        let Some(session) = self.session.read().await.clone() else {
            return InboundOutcome::Inactive;
        };

        let msg = match LocationUpdateMessage::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Discarding malformed location update: {e}");
                self.stats.inbound_malformed.fetch_add(1, Ordering::Relaxed);
                return InboundOutcome::Malformed;
            }
        };

        // Our own broadcasts come back on the topic; never place ourselves.
        if msg.peer_id == session.local_id {
            self.stats.inbound_self_echo.fetch_add(1, Ordering::Relaxed);
            return InboundOutcome::SelfEcho;
        }

        let (peer_id, position) = match msg.into_entry(epoch_millis()) {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("Discarding invalid location update: {e}");
                self.stats.inbound_malformed.fetch_add(1, Ordering::Relaxed);
                return InboundOutcome::Malformed;
            }
        };

        log::trace!("Peer {peer_id} at {:?}", position.coordinates());
        if self.registry.upsert_in_epoch(session.epoch, peer_id, position).await {
            self.stats.inbound_applied.fetch_add(1, Ordering::Relaxed);
            InboundOutcome::Applied
        } else {
            InboundOutcome::Stale
        }
    }

    /// Connection task: connect, serve, back off, repeat until shutdown.
    async fn run<C: Connector>(
        self: Arc<Self>,
        connector: Arc<C>,
        session: Session,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let delay = self.config.reconnect_delay();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match self.run_link(connector.as_ref(), &session, &mut shutdown).await {
                LinkExit::Shutdown => break,
                LinkExit::Lost(e) => {
                    *self.outbound.write().await = None;
                    self.stats.links_lost.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Reconnecting);
                    log::warn!("Broker link lost: {e}; reconnecting in {delay:?}");

                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        *self.outbound.write().await = None;
        log::debug!("Connection task for {} stopped", session.local_id);
    }

    async fn run_link<C: Connector>(
        &self,
        connector: &C,
        session: &Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkExit {
        let timeout = self.config.connect_timeout();
        let handshake = tokio::select! {
            _ = shutdown.changed() => return LinkExit::Shutdown,
            result = tokio::time::timeout(timeout, self.handshake(connector)) => result,
        };
        let mut link = match handshake {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return LinkExit::Lost(e),
            Err(_) => return LinkExit::Lost(LinkError::HandshakeTimeout(timeout)),
        };

        let subscribe = Frame::subscribe(SUBSCRIPTION_ID, &self.config.subscribe_topic);
        if link.conn.outgoing.send(subscribe.encode()).await.is_err() {
            return LinkExit::Lost(TransportError::Closed(None).into());
        }
        *self.outbound.write().await = Some(link.conn.outgoing.clone());
        self.set_state(ConnectionState::Connected);
        log::info!(
            "Connected to {} as {}, subscribed to {}",
            self.config.broker_url,
            session.local_id,
            self.config.subscribe_topic
        );

        let exit = self.serve(&mut link, shutdown).await;
        *self.outbound.write().await = None;

        if matches!(exit, LinkExit::Shutdown) {
            let goodbye = format!(
                "{}{}",
                Frame::unsubscribe(SUBSCRIPTION_ID).encode(),
                Frame::disconnect(None).encode()
            );
            let _ = link.conn.outgoing.try_send(goodbye);
        }
        exit
    }

    /// Open the transport and exchange CONNECT/CONNECTED.
    async fn handshake<C: Connector>(&self, connector: &C) -> Result<Link, LinkError> {
        self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let mut conn = connector.connect(&self.config.broker_url).await?;

        let ours = HeartBeat::new(self.config.heartbeat_outgoing_ms, self.config.heartbeat_incoming_ms);
        let connect = Frame::connect(self.config.stomp_host.as_deref(), ours);
        conn.outgoing
            .send(connect.encode())
            .await
            .map_err(|_| TransportError::Closed(None))?;

        let mut decoder = FrameDecoder::new();
        loop {
            match next_incoming(&mut conn, &mut decoder).await? {
                Incoming::Heartbeat => continue,
                Incoming::Frame(frame) => match frame.command {
                    Command::Connected => {
                        let heart_beat = ours.negotiate(&frame.heart_beat()?);
                        log::debug!(
                            "STOMP {} session, heart-beat {:?}",
                            frame.get("version").unwrap_or("1.0"),
                            heart_beat
                        );
                        return Ok(Link {
                            conn,
                            decoder,
                            heart_beat,
                        });
                    }
                    Command::Error => return Err(LinkError::Broker(describe_error(&frame))),
                    other => return Err(LinkError::UnexpectedFrame(other)),
                },
            }
        }
    }

    /// Serve an established link until it fails or shutdown is requested.
    async fn serve(&self, link: &mut Link, shutdown: &mut watch::Receiver<bool>) -> LinkExit {
        let outgoing_every = link.heart_beat.outgoing;
        let silence_limit = link
            .heart_beat
            .incoming
            .map(|every| every.mul_f64(self.config.heartbeat_timeout_factor));

        let period = outgoing_every.unwrap_or(Duration::from_secs(3600));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            // Frames may already be buffered from the handshake read.
            loop {
                match link.decoder.next_incoming() {
                    Ok(Some(Incoming::Heartbeat)) => {}
                    Ok(Some(Incoming::Frame(frame))) => {
                        if let Err(e) = self.on_frame(frame).await {
                            return LinkExit::Lost(e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return LinkExit::Lost(e.into()),
                }
            }

            let deadline = last_seen + silence_limit.unwrap_or(Duration::ZERO);
            tokio::select! {
                biased;
                _ = shutdown.changed() => return LinkExit::Shutdown,
                event = link.conn.incoming.recv() => match event {
                    Some(TransportEvent::Text(text)) => {
                        last_seen = Instant::now();
                        link.decoder.push(text.as_bytes());
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        return LinkExit::Lost(TransportError::Closed(reason).into());
                    }
                    Some(TransportEvent::Error(e)) => {
                        return LinkExit::Lost(TransportError::Io(e).into());
                    }
                    None => return LinkExit::Lost(TransportError::Closed(None).into()),
                },
                _ = heartbeat.tick(), if outgoing_every.is_some() => {
                    if let Err(mpsc::error::TrySendError::Closed(_)) =
                        link.conn.outgoing.try_send("\n".to_string())
                    {
                        return LinkExit::Lost(TransportError::Closed(None).into());
                    }
                }
                _ = tokio::time::sleep_until(deadline), if silence_limit.is_some() => {
                    return LinkExit::Lost(LinkError::HeartbeatTimeout(
                        silence_limit.unwrap_or_default(),
                    ));
                }
            }
        }
    }

    async fn on_frame(&self, frame: Frame) -> Result<(), LinkError> {
        match frame.command {
            Command::Message => {
                let ours = frame.get("subscription") == Some(SUBSCRIPTION_ID)
                    || frame.get("destination") == Some(self.config.subscribe_topic.as_str());
                if ours {
                    self.handle_inbound(&frame.body).await;
                } else {
                    log::debug!("Ignoring MESSAGE for unknown subscription");
                }
                Ok(())
            }
            Command::Error => Err(LinkError::Broker(describe_error(&frame))),
            Command::Receipt | Command::Connected => Ok(()),
            other => {
                log::debug!("Ignoring unexpected {other:?} frame");
                Ok(())
            }
        }
    }
}

async fn next_incoming(conn: &mut Connection, decoder: &mut FrameDecoder) -> Result<Incoming, LinkError> {
    loop {
        if let Some(incoming) = decoder.next_incoming()? {
            return Ok(incoming);
        }
        match conn.incoming.recv().await {
            Some(TransportEvent::Text(text)) => decoder.push(text.as_bytes()),
            Some(TransportEvent::Closed(reason)) => return Err(TransportError::Closed(reason).into()),
            Some(TransportEvent::Error(e)) => return Err(TransportError::Io(e).into()),
            None => return Err(TransportError::Closed(None).into()),
        }
    }
}

fn describe_error(frame: &Frame) -> String {
    match (frame.get("message"), frame.body.trim()) {
        (Some(message), "") => message.to_string(),
        (Some(message), body) => format!("{message}: {body}"),
        (None, "") => "unspecified".to_string(),
        (None, body) => body.to_string(),
    }
}
