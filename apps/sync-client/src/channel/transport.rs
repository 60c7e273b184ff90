//! Physical links underneath the event channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;

use crate::error::SyncError;

use super::events::{Identity, InboundEvent, OutboundEvent, FRAME_IDENTIFY, FRAME_READY};

/// One established connection.
///
/// The link is alive while `inbound` is open; the transport closes it when the
/// remote side goes away. Dropping `outbound` asks the transport to close.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<OutboundEvent>,
    pub inbound: mpsc::UnboundedReceiver<InboundEvent>,
}

/// Abstraction over how the channel reaches the server.
///
/// A WebSocket in production and an in-process pair in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link and complete the handshake carrying `identity`.
    async fn open(&self, identity: &Identity) -> Result<Link, SyncError>;
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

pub struct WsTransport {
    url: String,
    handshake_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, handshake_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            handshake_timeout,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, identity: &Identity) -> Result<Link, SyncError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::connection(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let identify = serde_json::json!({ "t": FRAME_IDENTIFY, "d": identity });
        ws_tx
            .send(Message::Text(identify.to_string().into()))
            .await
            .map_err(|e| SyncError::connection(e.to_string()))?;

        // The first text frame must be READY.
        let handshake = time::timeout(self.handshake_timeout, async {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let frame: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(e) => return Err(SyncError::from(e)),
                        };
                        if frame["t"] == FRAME_READY {
                            return Ok(());
                        }
                        return Err(SyncError::connection("expected READY frame"));
                    }
                    Ok(Message::Close(_)) => {
                        return Err(SyncError::connection("server closed during handshake"));
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(SyncError::connection(e.to_string())),
                }
            }
            Err::<(), SyncError>(SyncError::connection("connection closed before READY"))
        })
        .await;

        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_timeout) => return Err(SyncError::connection("handshake timeout")),
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundEvent>();

        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(?e, event = event.name(), "failed to encode outbound event");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<InboundEvent>(&text) {
                        Ok(event) => {
                            if in_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::debug!(?e, "dropping undecodable frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(?e, "ws read error");
                        break;
                    }
                }
            }
            // Dropping `in_tx` here is what the channel observes as a disconnect.
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// In-process implementation (offline mode / tests)
// ---------------------------------------------------------------------------

/// An in-process server endpoint. Records every handshake and every event the
/// client publishes, and lets the owner push events or sever the link.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryState>>,
}

struct MemoryState {
    reachable: bool,
    attempts: Vec<Instant>,
    identities: Vec<Identity>,
    to_client: Option<mpsc::UnboundedSender<InboundEvent>>,
    from_client: Option<mpsc::UnboundedReceiver<OutboundEvent>>,
    sent: Vec<OutboundEvent>,
}

impl MemoryState {
    fn drain(&mut self) {
        if let Some(rx) = self.from_client.as_mut() {
            while let Ok(event) = rx.try_recv() {
                self.sent.push(event);
            }
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                reachable: true,
                attempts: Vec::new(),
                identities: Vec::new(),
                to_client: None,
                from_client: None,
                sent: Vec::new(),
            })),
        }
    }

    /// When unreachable, every `open` fails with a connection error.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// Number of `open` calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts.len()
    }

    /// When each `open` call happened.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.inner.lock().attempts.clone()
    }

    /// Identities of successful handshakes, oldest first.
    pub fn identities(&self) -> Vec<Identity> {
        self.inner.lock().identities.clone()
    }

    /// Whether a client currently holds an open link.
    pub fn is_linked(&self) -> bool {
        self.inner
            .lock()
            .to_client
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Push an event to the connected client. Returns false if no link is open.
    pub fn deliver(&self, event: InboundEvent) -> bool {
        let state = self.inner.lock();
        match state.to_client.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the link from the server side, as a network failure would.
    pub fn sever(&self) {
        let mut state = self.inner.lock();
        state.drain();
        state.to_client = None;
        state.from_client = None;
    }

    /// Everything the client has published so far.
    pub fn sent(&self) -> Vec<OutboundEvent> {
        let mut state = self.inner.lock();
        state.drain();
        state.sent.clone()
    }

    /// Everything published since the last call.
    pub fn take_sent(&self) -> Vec<OutboundEvent> {
        let mut state = self.inner.lock();
        state.drain();
        std::mem::take(&mut state.sent)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, identity: &Identity) -> Result<Link, SyncError> {
        let mut state = self.inner.lock();
        state.attempts.push(Instant::now());
        if !state.reachable {
            return Err(SyncError::connection("endpoint unreachable"));
        }

        state.drain();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        state.identities.push(identity.clone());
        state.to_client = Some(in_tx);
        state.from_client = Some(out_rx);

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
