//! Producers of local position samples.
//!
//! A [`PositionSource`] is started once. It either yields a stream of
//! throttled samples or refuses with [`SourceError::PermissionDenied`], in
//! which case the session runs receive-only.

use futures_util::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::SamplingConfig;
use crate::position::{Position, SampleGate};

/// Samples from a started source.
pub type PositionStream = BoxStream<'static, Position>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("Location permission denied")]
    PermissionDenied,
    #[error("Location source unavailable: {0}")]
    Unavailable(String),
}

/// A permission-gated position producer.
pub trait PositionSource: Send + 'static {
    fn start(self) -> impl Future<Output = Result<PositionStream, SourceError>> + Send;
}

/// Source fed through a [`PositionSender`], throttled by a [`SampleGate`].
pub struct ChannelSource {
    rx: mpsc::Receiver<Position>,
    gate: SampleGate,
}

/// Feeding half of a [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct PositionSender {
    tx: mpsc::Sender<Position>,
}

impl ChannelSource {
    pub fn new(sampling: &SamplingConfig, buffer: usize) -> (PositionSender, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            PositionSender { tx },
            Self {
                rx,
                gate: SampleGate::new(sampling),
            },
        )
    }
}

impl PositionSource for ChannelSource {
    async fn start(self) -> Result<PositionStream, SourceError> {
        let samples = stream::unfold((self.rx, self.gate), |(mut rx, mut gate)| async move {
            loop {
                let sample = rx.recv().await?;
                if gate.admit(&sample) {
                    return Some((sample, (rx, gate)));
                }
                log::trace!("Sample at {:?} throttled", sample.coordinates());
            }
        });
        Ok(samples.boxed())
    }
}

impl PositionSender {
    /// Queue a raw sample. Returns `false` once the source is gone.
    pub async fn send(&self, sample: Position) -> bool {
        self.tx.send(sample).await.is_ok()
    }
}

/// A source whose permission request is always refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeniedSource;

impl PositionSource for DeniedSource {
    async fn start(self) -> Result<PositionStream, SourceError> {
        Err(SourceError::PermissionDenied)
    }
}
