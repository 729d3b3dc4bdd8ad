//! Development relay: a small STOMP-over-WebSocket broker.
//!
//! Architecture:
//! ```text
//! Peer A ──┐  SEND /app/update-location          ┌──► Peer A  MESSAGE
//!          ├──► route ──► TopicGroup(/topic/locations) ──► Peer B  MESSAGE
//! Peer B ──┘                                     └──► Peer C  MESSAGE
//! ```
//!
//! Each connection runs one task that owns the socket. SUBSCRIBE spawns a
//! forwarder per subscription that turns topic messages into MESSAGE frames
//! on the connection's outbound queue. Only the subset of STOMP the sync
//! channel needs is served; anything else is answered with ERROR and the
//! connection is closed, as the protocol requires.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{TopicGroup, TopicManager};
use crate::config::{ConfigError, RelayConfig};
use crate::frame::{Command, Frame, FrameDecoder, HeartBeat, Incoming, NegotiatedHeartBeat};

/// Silence tolerated from a client, as a multiple of its heartbeat interval.
const HEARTBEAT_GRACE: f64 = 2.0;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid relay config: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub messages_routed: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    messages_routed: AtomicU64,
}

struct RelayShared {
    config: RelayConfig,
    topics: TopicManager,
    stats: AtomicRelayStats,
}

/// The relay server.
pub struct Relay {
    shared: Arc<RelayShared>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let topics = TopicManager::new(config.topic_capacity);
        Ok(Self {
            shared: Arc::new(RelayShared {
                config,
                topics,
                stats: AtomicRelayStats::default(),
            }),
        })
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Bind the configured address and serve in the background.
    pub async fn spawn(self) -> Result<RelayHandle, RelayError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener)
    }

    /// Serve an already bound listener in the background.
    pub fn serve(self, listener: TcpListener) -> Result<RelayHandle, RelayError> {
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        log::info!("Relay listening on {addr}");

        let shared = self.shared.clone();
        let task = tokio::spawn(async move { shared.accept_loop(listener, shutdown_rx).await });
        Ok(RelayHandle {
            addr,
            shared: self.shared,
            shutdown,
            task: Some(task),
        })
    }
}

/// A running relay. Dropping it stops the relay.
pub struct RelayHandle {
    addr: SocketAddr,
    shared: Arc<RelayShared>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn stats(&self) -> RelayStats {
        let s = &self.shared.stats;
        RelayStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            frames_received: s.frames_received.load(Ordering::Relaxed),
            messages_routed: s.messages_routed.load(Ordering::Relaxed),
        }
    }

    pub async fn topic(&self, topic: &str) -> Option<Arc<TopicGroup>> {
        self.shared.topics.get(topic).await
    }

    /// Stop accepting, close every connection and wait for the tasks to end.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        log::info!("Relay on {} stopped", self.addr);
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl RelayShared {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let shared = self.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = shared.handle_connection(stream, addr, shutdown).await {
                                log::warn!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::error!("Accept failed: {e}"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);
        while connections.join_next().await.is_some() {}
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        let ws_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| RelayError::HandshakeTimeout)??;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.config.topic_capacity);
        let mut client = ClientSession::new(out_tx);
        let mut decoder = FrameDecoder::new();
        let mut last_seen = Instant::now();

        let result: Result<(), RelayError> = async {
            loop {
                let silence_limit = client.incoming.map(|every| every.mul_f64(HEARTBEAT_GRACE));
                tokio::select! {
                    _ = shutdown.changed() => {
                        log::debug!("Closing connection from {addr}: relay shutting down");
                        let _ = ws_sender.close().await;
                        break;
                    }

                    msg = ws_receiver.next() => {
                        let data = match msg {
                            Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                            Some(Ok(Message::Binary(data))) => data.to_vec(),
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => return Err(e.into()),
                        };
                        last_seen = Instant::now();
                        decoder.push(&data);

                        let mut close = false;
                        loop {
                            let frame = match decoder.next_incoming() {
                                Ok(Some(Incoming::Heartbeat)) => continue,
                                Ok(Some(Incoming::Frame(frame))) => frame,
                                Ok(None) => break,
                                Err(e) => {
                                    log::warn!("Malformed frame from {addr}: {e}");
                                    let error = Frame::error("Malformed frame", e.to_string());
                                    ws_sender.send(Message::Text(error.encode().into())).await?;
                                    close = true;
                                    break;
                                }
                            };
                            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            let outcome = self.dispatch(&mut client, frame).await;
                            if let Some(reply) = outcome.reply {
                                ws_sender.send(Message::Text(reply.encode().into())).await?;
                            }
                            if outcome.close {
                                close = true;
                                break;
                            }
                        }
                        if close {
                            let _ = ws_sender.close().await;
                            break;
                        }
                    }

                    Some(text) = out_rx.recv() => {
                        ws_sender.send(Message::Text(text.into())).await?;
                    }

                    _ = async {
                        match client.heartbeat.as_mut() {
                            Some(interval) => interval.tick().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        ws_sender.send(Message::Text("\n".into())).await?;
                    }

                    _ = tokio::time::sleep_until(last_seen + silence_limit.unwrap_or_default()),
                        if silence_limit.is_some() => {
                        log::warn!("No heartbeat from {addr}, closing");
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            }
            Ok(())
        }
        .await;

        for topic in client.close() {
            self.topics.remove_if_empty(&topic).await;
        }
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn dispatch(&self, client: &mut ClientSession, frame: Frame) -> Outcome {
        if !client.connected && !matches!(frame.command, Command::Connect | Command::Stomp) {
            return Outcome::fail("Not connected", "Send CONNECT first");
        }

        let outcome = match frame.command {
            Command::Connect | Command::Stomp => {
                if client.connected {
                    return Outcome::fail("Already connected", "");
                }
                let theirs = match frame.heart_beat() {
                    Ok(hb) => hb,
                    Err(e) => return Outcome::fail("Invalid heart-beat", e.to_string()),
                };
                let ours = HeartBeat::new(self.config.heartbeat_ms, self.config.heartbeat_ms);
                client.connect(ours.negotiate(&theirs));
                log::debug!("STOMP session started, client heart-beat {theirs}");
                return Outcome::reply(Frame::connected(ours));
            }

            Command::Subscribe => {
                let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination")) else {
                    return Outcome::fail("Invalid SUBSCRIBE", "id and destination are required");
                };
                let group = self.topics.get_or_create(destination).await;
                client.subscribe(id, group);
                log::debug!("Subscription {id} -> {destination}");
                Outcome::default()
            }

            Command::Unsubscribe => {
                let Some(id) = frame.get("id") else {
                    return Outcome::fail("Invalid UNSUBSCRIBE", "id is required");
                };
                if let Some(topic) = client.unsubscribe(id) {
                    self.topics.remove_if_empty(&topic).await;
                }
                Outcome::default()
            }

            Command::Send => {
                let Some(destination) = frame.get("destination") else {
                    return Outcome::fail("Invalid SEND", "destination is required");
                };
                match self.route(destination) {
                    Some(topic) => {
                        let group = self.topics.get_or_create(topic).await;
                        let reached = group.publish(frame.body.clone());
                        self.stats.messages_routed.fetch_add(1, Ordering::Relaxed);
                        log::trace!("{destination} -> {topic} ({reached} subscribers)");
                    }
                    None => log::debug!("No route for {destination}, dropping"),
                }
                Outcome::default()
            }

            Command::Disconnect => Outcome {
                reply: None,
                close: true,
            },

            other => return Outcome::fail("Unsupported command", other.as_str()),
        };

        // Receipts for everything past CONNECT
        match frame.get("receipt") {
            Some(receipt) => Outcome {
                reply: Some(Frame::receipt(receipt)),
                ..outcome
            },
            None => outcome,
        }
    }

    fn route<'a>(&'a self, destination: &'a str) -> Option<&'a str> {
        if let Some(topic) = self.config.routes.get(destination) {
            return Some(topic.as_str());
        }
        destination.starts_with("/topic/").then_some(destination)
    }
}

/// What to do after one client frame.
#[derive(Default)]
struct Outcome {
    reply: Option<Frame>,
    close: bool,
}

impl Outcome {
    fn reply(frame: Frame) -> Self {
        Self {
            reply: Some(frame),
            close: false,
        }
    }

    fn fail(message: &str, detail: impl Into<String>) -> Self {
        Self {
            reply: Some(Frame::error(message, detail)),
            close: true,
        }
    }
}

struct Subscription {
    topic: String,
    forwarder: JoinHandle<()>,
}

/// Per-connection STOMP state.
struct ClientSession {
    connected: bool,
    outbound: mpsc::Sender<String>,
    subscriptions: HashMap<String, Subscription>,
    heartbeat: Option<tokio::time::Interval>,
    incoming: Option<Duration>,
}

impl ClientSession {
    fn new(outbound: mpsc::Sender<String>) -> Self {
        Self {
            connected: false,
            outbound,
            subscriptions: HashMap::new(),
            heartbeat: None,
            incoming: None,
        }
    }

    fn connect(&mut self, negotiated: NegotiatedHeartBeat) {
        self.connected = true;
        self.incoming = negotiated.incoming;
        self.heartbeat = negotiated.outgoing.map(|every| {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
    }

    fn subscribe(&mut self, id: &str, group: Arc<TopicGroup>) {
        let topic = group.topic().to_string();
        let mut rx = group.subscribe();
        let outbound = self.outbound.clone();
        let subscription = id.to_string();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        let frame =
                            Frame::message(&msg.destination, &subscription, &msg.message_id, &msg.body);
                        if outbound.send(frame.encode()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        group.record_dropped(n);
                        log::warn!("Subscription {subscription} lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let replaced = self.subscriptions.insert(
            id.to_string(),
            Subscription { topic, forwarder },
        );
        if let Some(old) = replaced {
            old.forwarder.abort();
        }
    }

    fn unsubscribe(&mut self, id: &str) -> Option<String> {
        let subscription = self.subscriptions.remove(id)?;
        subscription.forwarder.abort();
        Some(subscription.topic)
    }

    /// Stop every forwarder; returns the topics that were subscribed.
    fn close(&mut self) -> Vec<String> {
        self.subscriptions
            .drain()
            .map(|(_, s)| {
                s.forwarder.abort();
                s.topic
            })
            .collect()
    }
}
