//! peermap: run a development relay or join the map as a peer.

mod cli;
mod source;
mod view;

use clap::Parser;
use log::{error, info};
use serde::Deserialize;
use std::path::Path;
use std::process::ExitCode;
use thiserror::Error;

use peermap_sync::config::{ConfigError, RelayConfig, SamplingConfig, SyncConfig};
use peermap_sync::identity::{IdentityError, IdentityProvider, MachineIdSource, PeerId};
use peermap_sync::relay::{Relay, RelayError};
use peermap_sync::session::PeerSession;
use peermap_sync::source::DeniedSource;
use peermap_sync::transport::WsConnector;

use cli::{Cli, Commands};
use source::LineSource;
use view::MapView;

#[derive(Debug, Error)]
enum CliError {
    #[error("Cannot read {path}: {source}")]
    ReadConfig {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    ParseConfig(#[from] toml::de::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("Signal handler failed: {0}")]
    Signal(std::io::Error),
}

/// Layout of the optional TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    sync: SyncConfig,
    sampling: SamplingConfig,
    relay: RelayConfig,
}

impl FileConfig {
    fn load(path: Option<&Path>) -> Result<Self, CliError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| CliError::ReadConfig {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

async fn run_relay(mut config: RelayConfig, bind: Option<String>) -> Result<(), CliError> {
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    let relay = Relay::new(config)?.spawn().await?;
    info!("Peers can connect to {}", relay.url());

    tokio::signal::ctrl_c().await.map_err(CliError::Signal)?;
    info!("Shutting down relay");
    relay.shutdown().await;
    Ok(())
}

async fn run_peer(
    file: FileConfig,
    url: Option<String>,
    peer_id: Option<String>,
    receive_only: bool,
) -> Result<(), CliError> {
    let mut sync = file.sync;
    if let Some(url) = url {
        sync.broker_url = url;
    }
    file.sampling.validate()?;

    let mut identity = IdentityProvider::new(MachineIdSource::default());
    if let Some(id) = peer_id {
        identity = identity.preset(PeerId::new(id)?);
    }

    let connector = WsConnector::new(sync.outbound_buffer);
    let session = if receive_only {
        PeerSession::start(&identity, sync, connector, DeniedSource).await?
    } else {
        let source = LineSource::stdin(&file.sampling);
        PeerSession::start(&identity, sync, connector, source).await?
    };
    info!("Joined as {} ({:?})", session.peer_id(), session.mode());

    let view = MapView::new(
        session.registry(),
        session.watch_state(),
        session.watch_local_position(),
    );
    let view_task = tokio::spawn(view.run());

    let signal = tokio::signal::ctrl_c().await;
    view_task.abort();
    session.shutdown().await;
    signal.map_err(CliError::Signal)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match FileConfig::load(cli.config.as_deref()) {
        Ok(file) => match cli.command {
            Commands::Relay { bind } => run_relay(file.relay, bind).await,
            Commands::Peer {
                url,
                peer_id,
                receive_only,
            } => run_peer(file, url, peer_id, receive_only).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
