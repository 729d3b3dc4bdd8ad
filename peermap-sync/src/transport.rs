//! Transport seam between the sync channel and the network.
//!
//! A [`Connector`] turns a broker URL into a [`Connection`]: a sender for
//! outbound text and a receiver of [`TransportEvent`]s. The channel's state
//! machine only ever sees these two queues, so it runs unchanged against
//! the WebSocket implementation below or an in-memory one in tests.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Connection closed{}", reason_suffix(.0))]
    Closed(Option<String>),
    #[error("Transport error: {0}")]
    Io(String),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

/// Something that happened on the inbound side of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A text payload (one or more STOMP frames, or heartbeats)
    Text(String),
    /// The remote end closed the connection
    Closed(Option<String>),
    /// The connection failed
    Error(String),
}

/// An open connection. Dropping it releases the underlying transport.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to a broker.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str)
        -> impl Future<Output = Result<Connection, TransportError>> + Send;
}

/// WebSocket transport (tokio-tungstenite).
///
/// Spawns one writer task forwarding the outbound queue to the socket and
/// one reader task forwarding socket messages to the inbound queue. When
/// every clone of `outgoing` is dropped the writer closes the socket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    buffer: usize,
}

impl WsConnector {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(self.buffer);

        // Writer task: forward outgoing queue to the socket
        let writer_events = in_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                    let _ = writer_events.send(TransportEvent::Error(e.to_string())).await;
                    return;
                }
            }
            let _ = ws_writer.close().await;
            log::debug!("WebSocket writer closed");
        });

        // Reader task: forward socket messages to the inbound queue
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => TransportEvent::Text(text.as_str().to_owned()),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => TransportEvent::Text(text),
                        Err(_) => {
                            log::debug!("Ignoring non-UTF-8 binary message");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.as_str().to_owned());
                        let _ = in_tx.send(TransportEvent::Closed(reason)).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(TransportEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                if in_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = in_tx.send(TransportEvent::Closed(None)).await;
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
