//! Last-known position of every remote peer.
//!
//! ## Semantics
//!
//! - One entry per peer id, overwritten unconditionally (last write wins).
//!   The carried timestamp is stored but never compared.
//! - Entries are never removed one by one; `clear()` drops them all.
//! - Every `clear()` starts a new epoch. Writers that belong to a session
//!   use [`PeerRegistry::upsert_in_epoch`], which is rejected once the
//!   epoch they captured has ended, so a late completion from a torn-down
//!   session can never repopulate a cleared registry.
//!
//! Readers get point-in-time copies through [`RegistryView`] and can watch a
//! revision counter to know when to redraw.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::identity::PeerId;
use crate::position::Position;

/// Point-in-time copy of the registry.
pub type Snapshot = HashMap<PeerId, Position>;

#[derive(Debug, Default)]
struct RegistryInner {
    epoch: u64,
    peers: HashMap<PeerId, Position>,
}

/// The mutable registry, owned by the sync channel.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            revision: Arc::new(revision),
        }
    }

    /// Insert or overwrite `peer_id`. Returns the previous position.
    pub async fn upsert(&self, peer_id: PeerId, position: Position) -> Option<Position> {
        let previous = self.inner.write().await.peers.insert(peer_id, position);
        self.bump();
        previous
    }

    /// Upsert on behalf of the session that captured `epoch`.
    ///
    /// Returns `false` (and leaves the registry untouched) if the registry
    /// has been cleared since.
    pub async fn upsert_in_epoch(&self, epoch: u64, peer_id: PeerId, position: Position) -> bool {
        {
            let mut inner = self.inner.write().await;
            if inner.epoch != epoch {
                return false;
            }
            inner.peers.insert(peer_id, position);
        }
        self.bump();
        true
    }

    /// Drop every entry and end the current epoch.
    pub async fn clear(&self) {
        {
            let mut inner = self.inner.write().await;
            inner.peers.clear();
            inner.epoch += 1;
        }
        self.bump();
    }

    /// Non-blocking clear for teardown paths that cannot await.
    /// Returns `false` if the lock was busy.
    pub fn try_clear(&self) -> bool {
        match self.inner.try_write() {
            Ok(mut inner) => {
                inner.peers.clear();
                inner.epoch += 1;
                drop(inner);
                self.bump();
                true
            }
            Err(_) => false,
        }
    }

    /// Current epoch; captured by a session when it starts.
    pub async fn epoch(&self) -> u64 {
        self.inner.read().await.epoch
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.peers.clone()
    }

    pub async fn get(&self, peer_id: &str) -> Option<Position> {
        self.inner.read().await.peers.get(peer_id).copied()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.peers.is_empty()
    }

    /// Revision counter, bumped on every mutation.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Read-only handle for the rendering layer.
    pub fn view(&self) -> RegistryView {
        RegistryView {
            registry: self.clone(),
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

/// Read-only access to a [`PeerRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryView {
    registry: PeerRegistry,
}

impl RegistryView {
    pub async fn snapshot(&self) -> Snapshot {
        self.registry.snapshot().await
    }

    pub async fn get(&self, peer_id: &str) -> Option<Position> {
        self.registry.get(peer_id).await
    }

    pub async fn len(&self) -> usize {
        self.registry.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.is_empty().await
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.registry.watch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        PeerId::new(s).unwrap()
    }

    fn pos(lat: f64, lon: f64, ts: i64) -> Position {
        Position::new(lat, lon, ts).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_snapshot() {
        let registry = PeerRegistry::new();
        assert!(registry.is_empty().await);

        assert_eq!(registry.upsert(id("ios_42"), pos(-12.05, -77.04, 1000)).await, None);
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["ios_42"].coordinates(), (-12.05, -77.04));
    }

    #[tokio::test]
    async fn test_last_write_wins_ignores_timestamps() {
        let registry = PeerRegistry::new();
        let newer = pos(1.0, 1.0, 2000);
        let older = pos(2.0, 2.0, 1000);

        registry.upsert(id("a"), newer).await;
        let previous = registry.upsert(id("a"), older).await;

        assert_eq!(previous, Some(newer));
        assert_eq!(registry.get("a").await, Some(older));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let registry = PeerRegistry::new();
        registry.upsert(id("a"), pos(1.0, 1.0, 0)).await;
        let snapshot = registry.snapshot().await;

        registry.upsert(id("b"), pos(2.0, 2.0, 0)).await;
        registry.clear().await;

        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_epoch_rejected_after_clear() {
        let registry = PeerRegistry::new();
        let epoch = registry.epoch().await;
        assert!(registry.upsert_in_epoch(epoch, id("a"), pos(1.0, 1.0, 0)).await);

        registry.clear().await;
        assert!(!registry.upsert_in_epoch(epoch, id("b"), pos(2.0, 2.0, 0)).await);
        assert!(registry.is_empty().await);

        let next = registry.epoch().await;
        assert_eq!(next, epoch + 1);
        assert!(registry.upsert_in_epoch(next, id("b"), pos(2.0, 2.0, 0)).await);
    }

    #[tokio::test]
    async fn test_try_clear() {
        let registry = PeerRegistry::new();
        registry.upsert(id("a"), pos(1.0, 1.0, 0)).await;
        assert!(registry.try_clear());
        assert!(registry.is_empty().await);
        assert_eq!(registry.epoch().await, 1);
    }

    #[tokio::test]
    async fn test_watch_revision_and_view() {
        let registry = PeerRegistry::new();
        let view = registry.view();
        let mut rx = view.watch();
        assert_eq!(*rx.borrow_and_update(), 0);

        registry.upsert(id("a"), pos(1.0, 1.0, 0)).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
        assert_eq!(view.get("a").await.map(|p| p.coordinates()), Some((1.0, 1.0)));

        registry.clear().await;
        assert_eq!(*rx.borrow_and_update(), 2);
        assert!(view.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let registry = PeerRegistry::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    registry
                        .upsert(id(&format!("peer-{i}")), pos(j as f64, 0.0, j))
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 16);
        assert!(snapshot.values().all(|p| p.latitude() == 49.0));
    }
}
