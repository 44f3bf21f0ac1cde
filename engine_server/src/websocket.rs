//! WebSocket bridge.
//!
//! Forwards text frames from browser-side clients into the dispatcher's
//! inbound queue, keyed by the peer's socket address, and lets the relay
//! write back to a bridged peer through the same connection instead of UDP.
//!
//! The reference implementation (`original_source/server/websocketrelay.py`)
//! ships this disabled — its `websockets`/`asyncio` imports are stubbed out
//! at the top of the file — but its shape is clear: key connections by peer
//! address, redirect frames into the dispatcher, drop the entry on
//! disconnect. This is a working realization of that shape on
//! `tokio-tungstenite`.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{atomic::AtomicBool, atomic::Ordering, Arc},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{info, warn};

use engine_shared::relay::WebSocketPeers;

/// A bridged browser connection, addressable the same way a UDP peer is.
pub struct WebSocketBridge {
    peers: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Message>>>,
}

impl WebSocketBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Accepts connections on `addr` until `running` clears, forwarding each
    /// text frame into `inbound` tagged with the connection's peer address.
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
        running: Arc<AtomicBool>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "websocket bridge listening");
        while running.load(Ordering::Relaxed) {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "websocket accept failed");
                    continue;
                }
            };
            let bridge = self.clone();
            let inbound = inbound.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.handle_connection(stream, peer, inbound).await {
                    warn!(%peer, error = %e, "websocket connection ended");
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        inbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    ) -> anyhow::Result<()> {
        let ws = accept_async(stream).await?;
        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.peers.lock().await.insert(peer, tx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if inbound.send((text.into_bytes(), peer)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        info!(%peer, "websocket client disconnected");
        self.peers.lock().await.remove(&peer);
        writer.abort();
        Ok(())
    }
}

#[async_trait::async_trait]
impl WebSocketPeers for WebSocketBridge {
    async fn send_if_bridged(&self, addr: SocketAddr, payload: &[u8]) -> bool {
        let peers = self.peers.lock().await;
        let Some(tx) = peers.get(&addr) else {
            return false;
        };
        let Ok(text) = std::str::from_utf8(payload) else {
            return false;
        };
        tx.send(Message::Text(text.to_string())).is_ok()
    }
}
