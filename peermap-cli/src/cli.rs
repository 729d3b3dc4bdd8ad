//! Command line definition.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "peermap")]
#[command(version = "0.1.0")]
#[command(about = "Share live positions with nearby peers over a STOMP broker")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,

    /// TOML file with [sync], [sampling] and [relay] tables
    #[arg(short, long, global = true)]
    pub(crate) config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run the development relay broker
    Relay {
        /// Address to listen on (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Join as a peer, reading `lat,lon[,accuracy]` lines from stdin
    Peer {
        /// Broker WebSocket URL (overrides the config file)
        #[arg(short, long)]
        url: Option<String>,

        /// Use this peer id instead of deriving one from the machine id
        #[arg(long)]
        peer_id: Option<String>,

        /// Only show other peers, never publish
        #[arg(long)]
        receive_only: bool,
    },
}
