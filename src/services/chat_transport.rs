//! Transport seam under the connection supervisor.
//!
//! A [`Connector`] opens one socket and hands back a [`Link`]: a sender for
//! outgoing text/close requests and a receiver of inbound text plus one final
//! close notification. Reconnection policy lives above this layer.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{ChatError, Result};
use crate::services::config::DEFAULT_CONNECT_TIMEOUT_MS;

/// Request to the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    /// Always the last event. `clean` is true when the closing handshake
    /// completed, false when the socket errored or dropped.
    Closed {
        clean: bool,
        code: Option<u16>,
        reason: String,
    },
}

/// One open socket.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<Outgoing>,
    pub incoming: mpsc::UnboundedReceiver<LinkEvent>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link>;
}

// ── WebSocket ──────────────────────────────────────────────────

/// Connector over a real WebSocket (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// `connect_timeout` bounds the TCP, TLS and upgrade handshake together.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        log::info!("Opening WebSocket to {}", url);
        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| {
                    ChatError::TransportUnavailable(format!(
                        "Connect {}: no handshake within {:?}",
                        url, self.connect_timeout
                    ))
                })?
                .map_err(|e| ChatError::TransportUnavailable(format!("Connect {}: {}", url, e)))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        // Writer: runs until the sender side is dropped or a close is requested.
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                match out {
                    Outgoing::Text(text) => {
                        if let Err(e) = write.send(WsMessage::text(text)).await {
                            log::warn!("WebSocket write failed: {}", e);
                            break;
                        }
                    }
                    Outgoing::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = write.send(WsMessage::Close(Some(frame))).await {
                            log::debug!("WebSocket close failed: {}", e);
                        }
                        return;
                    }
                }
            }
            let _ = write.close().await;
        });

        // Reader: forwards text frames, then reports how the socket ended.
        tokio::spawn(async move {
            let closed = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if in_tx.send(LinkEvent::Text(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break LinkEvent::Closed {
                            clean: true,
                            code: frame.as_ref().map(|f| u16::from(f.code)),
                            reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                        };
                    }
                    Some(Ok(_)) => {
                        // Binary and control frames carry nothing for us.
                    }
                    Some(Err(e)) => {
                        break LinkEvent::Closed {
                            clean: false,
                            code: None,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break LinkEvent::Closed {
                            clean: false,
                            code: None,
                            reason: "connection dropped".to_string(),
                        };
                    }
                }
            };
            let _ = in_tx.send(closed);
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

// ── In-memory loopback ─────────────────────────────────────────

/// Connector whose "server" is the caller: every accepted connection shows up
/// as a [`MemoryPeer`] on the receiver returned by [`MemoryConnector::new`].
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Mutex<MemoryInner>>,
}

struct MemoryInner {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    refusing: bool,
    attempts: usize,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                accepted: tx,
                refusing: false,
                attempts: 0,
            })),
        };
        (connector, rx)
    }

    /// While refusing, every connect attempt fails with `TransportUnavailable`.
    pub fn set_refusing(&self, refusing: bool) {
        self.lock().refusing = refusing;
    }

    /// Connect attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let mut inner = self.lock();
        inner.attempts += 1;
        if inner.refusing {
            return Err(ChatError::TransportUnavailable(format!(
                "Connection to {} refused",
                url
            )));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.to_string(),
            outgoing: out_rx,
            incoming: in_tx,
        };
        inner
            .accepted
            .send(peer)
            .map_err(|_| ChatError::TransportUnavailable("Loopback server gone".to_string()))?;

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Server end of one in-memory connection.
pub struct MemoryPeer {
    pub url: String,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    incoming: mpsc::UnboundedSender<LinkEvent>,
}

impl MemoryPeer {
    /// Deliver a text frame to the client. Returns false once the client is gone.
    pub fn push(&self, text: &str) -> bool {
        self.incoming.send(LinkEvent::Text(text.to_string())).is_ok()
    }

    /// Next thing the client wrote, waiting for it.
    pub async fn next(&mut self) -> Option<Outgoing> {
        self.outgoing.recv().await
    }

    /// Next text frame the client wrote, skipping close requests.
    pub async fn next_text(&mut self) -> Option<String> {
        loop {
            match self.outgoing.recv().await? {
                Outgoing::Text(text) => return Some(text),
                Outgoing::Close { .. } => continue,
            }
        }
    }

    /// Everything the client has written so far, without waiting.
    pub fn drain_texts(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(out) = self.outgoing.try_recv() {
            if let Outgoing::Text(text) = out {
                texts.push(text);
            }
        }
        texts
    }

    /// End the connection from the server side.
    pub fn close(self, clean: bool) {
        let _ = self.incoming.send(LinkEvent::Closed {
            clean,
            code: clean.then_some(1000),
            reason: if clean { "normal closure" } else { "abnormal closure" }.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_link_carries_both_directions() {
        let (connector, mut accepted) = MemoryConnector::new();
        let mut link = connector.connect("ws://relay/ws/alice").await.unwrap();
        let mut peer = accepted.recv().await.unwrap();
        assert_eq!(peer.url, "ws://relay/ws/alice");

        link.outgoing.send(Outgoing::Text("up".into())).unwrap();
        assert_eq!(peer.next_text().await.as_deref(), Some("up"));

        assert!(peer.push("down"));
        assert_eq!(link.incoming.recv().await, Some(LinkEvent::Text("down".into())));

        peer.close(false);
        assert!(matches!(
            link.incoming.recv().await,
            Some(LinkEvent::Closed { clean: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts the TCP connection but never answers the upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let connector = WebSocketConnector::new(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = connector
            .connect(&format!("ws://{}/ws/alice", addr))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }

    #[tokio::test]
    async fn test_refusing_connector_counts_attempts() {
        let (connector, _accepted) = MemoryConnector::new();
        connector.set_refusing(true);
        let err = connector.connect("ws://relay/ws/alice").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(connector.attempts(), 1);
    }
}
