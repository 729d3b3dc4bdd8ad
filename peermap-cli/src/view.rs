//! Text rendering of the peer map.
//!
//! Redraws only when something changed: the registry revision, the
//! connection state or the local position.

use peermap_sync::channel::ConnectionState;
use peermap_sync::position::{epoch_millis, Position};
use peermap_sync::registry::{RegistryView, Snapshot};
use std::fmt::Write;
use tokio::sync::watch;

pub(crate) struct MapView {
    registry: RegistryView,
    state: watch::Receiver<ConnectionState>,
    local: watch::Receiver<Option<Position>>,
}

impl MapView {
    pub(crate) fn new(
        registry: RegistryView,
        state: watch::Receiver<ConnectionState>,
        local: watch::Receiver<Option<Position>>,
    ) -> Self {
        Self {
            registry,
            state,
            local,
        }
    }

    /// Print a frame on every change until the session goes away.
    pub(crate) async fn run(mut self) {
        let mut revisions = self.registry.watch();
        loop {
            let snapshot = self.registry.snapshot().await;
            let state = *self.state.borrow_and_update();
            let local = *self.local.borrow_and_update();
            println!("{}", render(&snapshot, state, local, epoch_millis()));

            tokio::select! {
                changed = revisions.changed() => if changed.is_err() { break },
                changed = self.state.changed() => if changed.is_err() { break },
                changed = self.local.changed() => if changed.is_err() { break },
            }
        }
    }
}

/// One frame of output: status line, local fix, then peers sorted by id.
pub(crate) fn render(
    snapshot: &Snapshot,
    state: ConnectionState,
    local: Option<Position>,
    now_ms: i64,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[{state:?}] {} peer(s)", snapshot.len());
    match local {
        Some(position) => {
            let (lat, lon) = position.coordinates();
            let _ = writeln!(out, "  (you)  {lat:>10.6} {lon:>11.6}");
        }
        None => {
            let _ = writeln!(out, "  (you)  no fix");
        }
    }

    let mut peers: Vec<_> = snapshot.iter().collect();
    peers.sort_by(|a, b| a.0.cmp(b.0));
    for (peer_id, position) in peers {
        let (lat, lon) = position.coordinates();
        let age_s = now_ms.saturating_sub(position.timestamp()).max(0) / 1000;
        let _ = writeln!(out, "  {peer_id}  {lat:>10.6} {lon:>11.6}  {age_s}s ago");
    }
    out.truncate(out.trim_end().len());
    out
}
