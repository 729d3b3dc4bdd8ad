//! Local peer identity.
//!
//! Resolution order:
//! 1. An installation-scoped identifier from the host (the systemd/dbus
//!    machine id on Linux). The raw value is never put on the wire; it is
//!    folded into a name-based UUID so the broadcast id is stable without
//!    leaking the host secret.
//! 2. `<platform>_<random suffix>`, valid for this process only.
//!
//! Failure of (1) is logged and swallowed. [`IdentityProvider::resolve_id`]
//! always succeeds and always returns the same id within a process.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Namespace for name-based peer ids derived from device identifiers.
const PEER_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a8e_93b4_4d0a_9c51_7e2b_d4f8_a613);

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Peer id must not be empty")]
    EmptyId,
    #[error("Device identifier unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error reading device identifier: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque, non-empty peer identifier. Any other string is accepted as is,
/// whitespace included, so remote ids round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::EmptyId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A host service that may know a stable per-installation identifier.
pub trait DeviceIdSource: Send + Sync {
    fn device_id(&self) -> impl Future<Output = Result<String, IdentityError>> + Send;
}

/// Reads the machine id from the usual Linux locations.
#[derive(Debug, Clone)]
pub struct MachineIdSource {
    paths: Vec<PathBuf>,
}

impl MachineIdSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl Default for MachineIdSource {
    fn default() -> Self {
        Self::new(vec![
            PathBuf::from("/etc/machine-id"),
            PathBuf::from("/var/lib/dbus/machine-id"),
        ])
    }
}

impl DeviceIdSource for MachineIdSource {
    async fn device_id(&self) -> Result<String, IdentityError> {
        let mut last_error = IdentityError::Unavailable("no machine id path configured".into());
        for path in &self.paths {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let id = content.trim();
                    if !id.is_empty() {
                        return Ok(id.to_string());
                    }
                    last_error = IdentityError::Unavailable(format!("{} is empty", path.display()));
                }
                Err(e) => last_error = IdentityError::Io(e),
            }
        }
        Err(last_error)
    }
}

/// A source that never has a device id; always degrades to the fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDeviceId;

impl DeviceIdSource for NoDeviceId {
    async fn device_id(&self) -> Result<String, IdentityError> {
        Err(IdentityError::Unavailable("no device id on this host".into()))
    }
}

/// Resolves the local [`PeerId`] once per process.
pub struct IdentityProvider<S> {
    source: S,
    platform: String,
    resolved: OnceCell<PeerId>,
}

impl<S: DeviceIdSource> IdentityProvider<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            platform: std::env::consts::OS.to_string(),
            resolved: OnceCell::new(),
        }
    }

    /// Override the platform tag used as the id prefix.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Skip resolution and use `id` (e.g. an operator-supplied id).
    pub fn preset(mut self, id: PeerId) -> Self {
        self.resolved = OnceCell::new_with(Some(id));
        self
    }

    /// Resolve the local peer id. Idempotent.
    pub async fn resolve_id(&self) -> PeerId {
        self.resolved
            .get_or_init(|| async {
                let id = match self.source.device_id().await {
                    Ok(raw) => self.derived_id(&raw),
                    Err(e) => {
                        log::warn!("Device id unavailable ({e}), using a session-scoped id");
                        self.fallback_id()
                    }
                };
                log::info!("Local peer id resolved: {id}");
                id
            })
            .await
            .clone()
    }

    /// The id, if already resolved.
    pub fn resolved(&self) -> Option<&PeerId> {
        self.resolved.get()
    }

    fn derived_id(&self, raw: &str) -> PeerId {
        let stable = Uuid::new_v5(&PEER_ID_NAMESPACE, raw.as_bytes());
        PeerId(format!("{}_{}", self.platform, stable.simple()))
    }

    fn fallback_id(&self) -> PeerId {
        let suffix = Uuid::new_v4().simple().to_string();
        PeerId(format!("{}_{}", self.platform, &suffix[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        id: Option<&'static str>,
    }

    impl DeviceIdSource for CountingSource {
        async fn device_id(&self) -> Result<String, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.id
                .map(str::to_string)
                .ok_or_else(|| IdentityError::Unavailable("test".into()))
        }
    }

    #[test]
    fn test_peer_id_only_rejects_empty() {
        assert!(matches!(PeerId::new(""), Err(IdentityError::EmptyId)));
        assert_eq!(PeerId::new("   ").unwrap().as_str(), "   ");
        assert_eq!(PeerId::new("ios_42").unwrap().as_str(), "ios_42");
    }

    #[test]
    fn test_peer_id_serde_is_plain_string() {
        let id = PeerId::new("android_7").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""android_7""#);
        assert!(serde_json::from_str::<PeerId>(r#""""#).is_err());
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = IdentityProvider::new(CountingSource {
            calls: calls.clone(),
            id: Some("abc123"),
        });

        let first = provider.resolve_id().await;
        let second = provider.resolve_id().await;
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.resolved(), Some(&first));
    }

    #[tokio::test]
    async fn test_device_id_is_stable_across_providers() {
        let make = || {
            IdentityProvider::new(CountingSource {
                calls: Arc::new(AtomicUsize::new(0)),
                id: Some("abc123"),
            })
            .with_platform("ios")
        };
        let a = make().resolve_id().await;
        let b = make().resolve_id().await;
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("ios_"));
        assert!(!a.as_str().contains("abc123"));
    }

    #[tokio::test]
    async fn test_fallback_when_unavailable() {
        let provider = IdentityProvider::new(NoDeviceId).with_platform("android");
        let id = provider.resolve_id().await;
        assert!(id.as_str().starts_with("android_"));
        assert_eq!(id.as_str().len(), "android_".len() + 8);
        assert_eq!(provider.resolve_id().await, id);
    }

    #[tokio::test]
    async fn test_fallback_ids_differ_between_processes() {
        let a = IdentityProvider::new(NoDeviceId).resolve_id().await;
        let b = IdentityProvider::new(NoDeviceId).resolve_id().await;
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_preset_skips_source() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = IdentityProvider::new(CountingSource {
            calls: calls.clone(),
            id: Some("abc123"),
        })
        .preset(PeerId::new("ios_42").unwrap());

        assert_eq!(provider.resolve_id().await.as_str(), "ios_42");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_machine_id_source_reads_first_available() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let empty = dir.path().join("empty");
        let present = dir.path().join("machine-id");
        std::fs::File::create(&empty).unwrap();
        let mut f = std::fs::File::create(&present).unwrap();
        writeln!(f, "0123456789abcdef").unwrap();

        let source = MachineIdSource::new(vec![missing, empty, present]);
        assert_eq!(source.device_id().await.unwrap(), "0123456789abcdef");
    }

    #[tokio::test]
    async fn test_machine_id_source_missing_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let source = MachineIdSource::new(vec![dir.path().join("nope")]);
        assert!(source.device_id().await.is_err());

        let provider = IdentityProvider::new(source).with_platform("linux");
        assert!(provider.resolve_id().await.as_str().starts_with("linux_"));
    }
}
