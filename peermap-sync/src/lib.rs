//! # peermap-sync: Live peer location sharing over STOMP
//!
//! Every peer publishes its own position to a shared broker and renders the
//! last known position of everyone else.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  SEND /app/update-location   ┌──────────────┐
//! │ SyncChannel  │ ───────────────────────────► │ STOMP broker │
//! │ (per peer)   │ ◄─────────────────────────── │ (or Relay)   │
//! └──────┬───────┘  MESSAGE /topic/locations    └──────────────┘
//!        │             (to every subscriber)
//!        ▼
//! ┌──────────────┐    drop own id (self-echo)
//! │ PeerRegistry │    last write wins per peer
//! │ id → Position│    cleared on deactivate
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`identity`]: stable per-device peer id
//! - [`position`]: validated samples and producer-side throttling
//! - [`protocol`]: JSON body of location updates
//! - [`frame`]: STOMP 1.2 frame codec and heart-beat negotiation
//! - [`transport`]: connector seam, WebSocket implementation
//! - [`channel`]: connection state machine, publish and inbound handling
//! - [`registry`]: remote peers' last known positions
//! - [`source`]: permission-gated position producers
//! - [`session`]: identity + channel + feed for one running peer
//! - [`broadcast`] / [`relay`]: development broker

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod frame;
pub mod identity;
pub mod position;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod source;
pub mod transport;

// Re-exports for convenience
pub use channel::{ChannelStats, ConnectionState, InboundOutcome, LinkError, Publisher, SyncChannel};
pub use config::{ConfigError, RelayConfig, SamplingConfig, SyncConfig};
pub use frame::{Command, Frame, FrameDecoder, FrameError, HeartBeat};
pub use identity::{DeviceIdSource, IdentityError, IdentityProvider, MachineIdSource, NoDeviceId, PeerId};
pub use position::{Position, PositionError, SampleGate};
pub use protocol::{LocationUpdateMessage, ProtocolError};
pub use registry::{PeerRegistry, RegistryView, Snapshot};
pub use relay::{Relay, RelayError, RelayHandle, RelayStats};
pub use session::{PeerSession, SessionMode};
pub use source::{ChannelSource, DeniedSource, PositionSender, PositionSource, PositionStream, SourceError};
pub use transport::{Connection, Connector, TransportError, TransportEvent, WsConnector};
