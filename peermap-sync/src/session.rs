//! One running peer: identity, channel and position feed wired together.

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{ConnectionState, Publisher, SyncChannel};
use crate::config::{ConfigError, SyncConfig};
use crate::identity::{DeviceIdSource, IdentityProvider, PeerId};
use crate::position::Position;
use crate::registry::RegistryView;
use crate::source::{PositionSource, PositionStream, SourceError};
use crate::transport::Connector;

/// Whether the local peer broadcasts its own position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Publishing,
    /// Location permission was refused; remote peers are still shown
    ReceiveOnly,
}

/// A started peer session. Dropping it stops the feed and the channel.
pub struct PeerSession<C: Connector> {
    peer_id: PeerId,
    mode: SessionMode,
    channel: SyncChannel<C>,
    local: watch::Receiver<Option<Position>>,
    feed: Option<JoinHandle<()>>,
}

impl<C: Connector> PeerSession<C> {
    /// Resolve the local id, activate the channel and start publishing
    /// samples from `source` if it grants permission.
    pub async fn start<S, P>(
        identity: &IdentityProvider<S>,
        config: SyncConfig,
        connector: C,
        source: P,
    ) -> Result<Self, ConfigError>
    where
        S: DeviceIdSource,
        P: PositionSource,
    {
        let peer_id = identity.resolve_id().await;
        let mut channel = SyncChannel::new(config, connector)?;
        channel.activate(peer_id.clone()).await;

        let (local_tx, local) = watch::channel(None);
        let (mode, feed) = match source.start().await {
            Ok(samples) => {
                let publisher = channel.publisher();
                let feed = tokio::spawn(run_feed(samples, publisher, local_tx));
                (SessionMode::Publishing, Some(feed))
            }
            Err(SourceError::PermissionDenied) => {
                log::warn!("Location permission denied, running receive-only");
                (SessionMode::ReceiveOnly, None)
            }
            Err(e) => {
                log::warn!("{e}, running receive-only");
                (SessionMode::ReceiveOnly, None)
            }
        };

        Ok(Self {
            peer_id,
            mode,
            channel,
            local,
            feed,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.watch_state()
    }

    pub fn registry(&self) -> RegistryView {
        self.channel.registry()
    }

    pub fn channel(&self) -> &SyncChannel<C> {
        &self.channel
    }

    /// Latest local sample, for centring the map.
    pub fn local_position(&self) -> Option<Position> {
        *self.local.borrow()
    }

    pub fn watch_local_position(&self) -> watch::Receiver<Option<Position>> {
        self.local.clone()
    }

    /// Stop the feed, then deactivate the channel.
    pub async fn shutdown(mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
        self.channel.deactivate().await;
        log::info!("Session for {} closed", self.peer_id);
    }
}

impl<C: Connector> Drop for PeerSession<C> {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
    }
}

async fn run_feed(
    mut samples: PositionStream,
    publisher: Publisher,
    local: watch::Sender<Option<Position>>,
) {
    while let Some(sample) = samples.next().await {
        local.send_replace(Some(sample));
        if !publisher.publish(&sample).await {
            log::trace!("Sample not published ({:?})", publisher.state());
        }
    }
    log::debug!("Position feed ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingConfig;
    use crate::frame::{Command, HeartBeat};
    use crate::identity::NoDeviceId;
    use crate::source::{ChannelSource, DeniedSource};
    use crate::transport::mock::MockConnector;

    fn config() -> SyncConfig {
        SyncConfig {
            broker_url: "ws://mock/ws".to_string(),
            heartbeat_outgoing_ms: 0,
            heartbeat_incoming_ms: 0,
            ..SyncConfig::default()
        }
    }

    fn identity(id: &str) -> IdentityProvider<NoDeviceId> {
        IdentityProvider::new(NoDeviceId).preset(PeerId::new(id).unwrap())
    }

    #[tokio::test]
    async fn test_publishing_session() {
        let (connector, mut brokers) = MockConnector::new();
        let (sender, source) = ChannelSource::new(&SamplingConfig::default(), 8);
        let session = PeerSession::start(&identity("ios_42"), config(), connector, source)
            .await
            .unwrap();
        assert_eq!(session.mode(), SessionMode::Publishing);
        assert_eq!(session.peer_id().as_str(), "ios_42");

        let mut broker = brokers.recv().await.unwrap();
        broker.accept(HeartBeat::default()).await;
        session
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        let mut local = session.watch_local_position();
        sender.send(Position::new(-12.05, -77.04, 1000).unwrap()).await;
        local.wait_for(Option::is_some).await.unwrap();
        assert_eq!(
            session.local_position().map(|p| p.coordinates()),
            Some((-12.05, -77.04))
        );

        let frame = broker.next_frame().await.unwrap();
        assert_eq!(frame.command, Command::Send);
        assert!(frame.body.contains(r#""userId":"ios_42""#));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_denied_permission_runs_receive_only() {
        let (connector, mut brokers) = MockConnector::new();
        let session = PeerSession::start(&identity("android_7"), config(), connector, DeniedSource)
            .await
            .unwrap();
        assert_eq!(session.mode(), SessionMode::ReceiveOnly);

        let mut broker = brokers.recv().await.unwrap();
        broker.accept(HeartBeat::default()).await;
        broker
            .deliver(
                "sub-0",
                r#"{"userId":"ios_42","latitude":-12.05,"longitude":-77.04,"timestamp":1000}"#,
            )
            .await;

        let registry = session.registry();
        let mut revisions = registry.watch();
        while registry.get("ios_42").await.is_none() {
            revisions.changed().await.unwrap();
        }
        assert_eq!(session.local_position(), None);
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let (connector, mut brokers) = MockConnector::new();
        let session = PeerSession::start(&identity("b"), config(), connector, DeniedSource)
            .await
            .unwrap();
        let mut broker = brokers.recv().await.unwrap();
        broker.accept(HeartBeat::default()).await;

        let channel = session.channel();
        channel
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        channel
            .on_inbound_message(r#"{"userId":"a","latitude":1,"longitude":1}"#)
            .await;
        let registry = session.registry();
        assert_eq!(registry.len().await, 1);

        session.shutdown().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let (connector, _) = MockConnector::new();
        let bad = SyncConfig {
            heartbeat_timeout_factor: 0.5,
            ..config()
        };
        let result = PeerSession::start(&identity("a"), bad, connector, DeniedSource).await;
        assert!(matches!(result, Err(ConfigError::HeartbeatFactor(_))));
    }
}
