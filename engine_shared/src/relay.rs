//! Message Relay: reliable delivery layered over an unreliable UDP socket.
//!
//! Mirrors `engine_shared::net`'s envelope split: callers hand this module a
//! [`Response`], the relay stamps `packet-id`/`timestamp` and owns retrying
//! until `confirm` arrives or retries are exhausted.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use tokio::{net::UdpSocket, sync::Mutex as AsyncMutex, time::Instant};
use tracing::warn;
use uuid::Uuid;

use crate::net::Response;

/// Default retry budget, matching the reference relay.
pub const DEFAULT_RETRIES: u32 = 1;
/// Default interval between retries.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// A websocket-bridged peer the relay can write to instead of the UDP
/// socket, keyed by the synthetic address the bridge assigned it.
#[async_trait::async_trait]
pub trait WebSocketPeers: Send + Sync {
    /// Sends `payload` to `addr` if it names a live websocket connection;
    /// returns `true` if it did (and the UDP path should be skipped).
    async fn send_if_bridged(&self, addr: SocketAddr, payload: &[u8]) -> bool;
}

/// No websocket bridge attached; every send goes over UDP.
pub struct NoWebSocketPeers;

#[async_trait::async_trait]
impl WebSocketPeers for NoWebSocketPeers {
    async fn send_if_bridged(&self, _addr: SocketAddr, _payload: &[u8]) -> bool {
        false
    }
}

struct PendingMessage {
    payload: Vec<u8>,
    addr: SocketAddr,
    retries_left: u32,
    elapsed: Duration,
}

/// Reliable-delivery layer. Cheap to clone: internals are `Arc`-shared.
#[derive(Clone)]
pub struct MessageRelay {
    inner: Arc<Inner>,
}

struct Inner {
    socket: Arc<UdpSocket>,
    websocket: Arc<dyn WebSocketPeers>,
    waiting: Mutex<HashMap<Uuid, PendingMessage>>,
    // Serializes retry ticks so only one driver runs `update()` at a time;
    // `send`/`confirm` only ever touch `waiting` directly.
    tick_lock: AsyncMutex<()>,
    default_retries: u32,
}

impl MessageRelay {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self::with_websocket(socket, Arc::new(NoWebSocketPeers))
    }

    pub fn with_websocket(socket: Arc<UdpSocket>, websocket: Arc<dyn WebSocketPeers>) -> Self {
        Self::with_websocket_and_retries(socket, websocket, DEFAULT_RETRIES)
    }

    /// Like [`Self::with_websocket`], but `send_default` uses `default_retries`
    /// instead of the hardcoded [`DEFAULT_RETRIES`] — wired to the
    /// dispatcher's configured retry budget.
    pub fn with_websocket_and_retries(
        socket: Arc<UdpSocket>,
        websocket: Arc<dyn WebSocketPeers>,
        default_retries: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                socket,
                websocket,
                waiting: Mutex::new(HashMap::new()),
                tick_lock: AsyncMutex::new(()),
                default_retries,
            }),
        }
    }

    /// Enqueues `response` for delivery to `addr`, stamping it with a fresh
    /// packet id and timestamp. Returns the packet id so the caller can
    /// correlate it if needed.
    ///
    /// The first wire transmission happens on the relay's next retry tick,
    /// not here — this enqueues only. `elapsed` is seeded already past
    /// `RETRY_INTERVAL` so that next tick fires immediately, matching the
    /// reference relay's `Message.__init__`, which pre-seeds `retry_int =
    /// retry_interval` so its own `update()` sends on the very first pass.
    pub fn send(&self, addr: SocketAddr, response: &Response, retries: u32) -> anyhow::Result<Uuid> {
        let packet_id = Uuid::new_v4();
        let mut value = serde_json::to_value(response).context("serialize response")?;
        stamp(&mut value, packet_id);
        let payload = serde_json::to_vec(&value).context("serialize envelope")?;

        let mut waiting = self.inner.waiting.lock().expect("relay lock poisoned");
        waiting.insert(
            packet_id,
            PendingMessage {
                payload,
                addr,
                retries_left: retries,
                elapsed: RETRY_INTERVAL,
            },
        );
        Ok(packet_id)
    }

    pub fn send_default(&self, addr: SocketAddr, response: &Response) -> anyhow::Result<Uuid> {
        self.send(addr, response, self.inner.default_retries)
    }

    /// Marks `packet_id` delivered. Idempotent: an unknown id returns
    /// `false` and is otherwise a no-op.
    pub fn confirm(&self, packet_id: Uuid) -> bool {
        let mut waiting = self.inner.waiting.lock().expect("relay lock poisoned");
        waiting.remove(&packet_id).is_some()
    }

    /// Number of entries still awaiting delivery or confirmation.
    pub fn pending_count(&self) -> usize {
        self.inner.waiting.lock().expect("relay lock poisoned").len()
    }

    /// Dumps packet ids currently waiting, for the `printqueue` console
    /// command.
    pub fn waiting_ids(&self) -> Vec<Uuid> {
        self.inner
            .waiting
            .lock()
            .expect("relay lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Advances every pending entry's elapsed-since-last-send accumulator by
    /// `delta` and resends any entry past `RETRY_INTERVAL`. Removal of
    /// exhausted/undeliverable entries is deferred to the end of the sweep
    /// so the iteration set stays stable, matching the reference loop's
    /// `to_remove` sweep.
    pub async fn tick(&self, delta: Duration) {
        let _guard = self.inner.tick_lock.lock().await;

        let due: Vec<(Uuid, Vec<u8>, SocketAddr)> = {
            let mut waiting = self.inner.waiting.lock().expect("relay lock poisoned");
            let mut due = Vec::new();
            let mut exhausted = Vec::new();
            for (id, pending) in waiting.iter_mut() {
                pending.elapsed += delta;
                if pending.elapsed >= RETRY_INTERVAL {
                    if pending.retries_left == 0 {
                        exhausted.push(*id);
                        continue;
                    }
                    pending.elapsed = Duration::ZERO;
                    pending.retries_left -= 1;
                    due.push((*id, pending.payload.clone(), pending.addr));
                }
            }
            for id in exhausted {
                waiting.remove(&id);
            }
            due
        };

        for (_id, payload, addr) in due {
            self.dispatch(addr, &payload).await;
        }
    }

    async fn dispatch(&self, addr: SocketAddr, payload: &[u8]) {
        if self.inner.websocket.send_if_bridged(addr, payload).await {
            return;
        }
        if let Err(e) = self.inner.socket.send_to(payload, addr).await {
            warn!(%addr, error = %e, "relay send failed, entry stays pending");
        }
    }
}

fn stamp(value: &mut Value, packet_id: Uuid) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    if let Value::Object(map) = value {
        map.insert("packet-id".to_string(), Value::String(packet_id.to_string()));
        map.insert(
            "timestamp".to_string(),
            serde_json::json!(now.as_secs_f64()),
        );
    }
}

/// Drives [`MessageRelay::tick`] on a fixed cadence until `running` is
/// cleared. The reference relay's loop body is a tight `while self.running`
/// with a zero-duration `time.sleep(0)` yield; a short sleep here avoids
/// pinning a whole core while keeping the same "drive retries as fast as
/// the scheduler allows" behavior.
pub async fn run_retry_loop(relay: MessageRelay, running: Arc<std::sync::atomic::AtomicBool>) {
    let mut last = Instant::now();
    while running.load(std::sync::atomic::Ordering::Relaxed) {
        let now = Instant::now();
        let delta = now.duration_since(last);
        last = now;
        relay.tick(delta).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

impl std::fmt::Debug for MessageRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRelay")
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ErrorKind;

    async fn bind_ephemeral() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn send_transmits_on_the_very_next_tick() {
        let server = bind_ephemeral().await;
        let client = bind_ephemeral().await;
        let client_addr = client.local_addr().unwrap();

        let relay = MessageRelay::new(server);
        let packet_id = relay
            .send(client_addr, &Response::error(ErrorKind::InternalError), DEFAULT_RETRIES)
            .unwrap();
        assert_eq!(relay.pending_count(), 1);

        let mut buf = [0u8; 1024];
        let nothing_yet = tokio::time::timeout(Duration::from_millis(20), client.recv(&mut buf)).await;
        assert!(nothing_yet.is_err(), "no transmission before the first tick");

        // `elapsed` is already seeded past `RETRY_INTERVAL`, so even a tick
        // with a negligible real delta sends right away.
        relay.tick(Duration::from_millis(1)).await;
        let n = tokio::time::timeout(Duration::from_millis(200), client.recv(&mut buf))
            .await
            .expect("datagram after tick")
            .unwrap();
        let value: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(value["packet-id"], packet_id.to_string());
    }

    #[tokio::test]
    async fn confirm_is_idempotent() {
        let server = bind_ephemeral().await;
        let client_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let relay = MessageRelay::new(server);
        let packet_id = relay
            .send(client_addr, &Response::error(ErrorKind::InternalError), DEFAULT_RETRIES)
            .unwrap();

        assert!(relay.confirm(packet_id));
        assert!(!relay.confirm(packet_id));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn send_default_honors_the_configured_retry_budget() {
        let server = bind_ephemeral().await;
        let client_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let relay = MessageRelay::with_websocket_and_retries(server, Arc::new(NoWebSocketPeers), 0);
        relay
            .send_default(client_addr, &Response::error(ErrorKind::InternalError))
            .unwrap();
        assert_eq!(relay.pending_count(), 1);
        // retries=0: the very first tick past the interval exhausts the entry.
        relay.tick(RETRY_INTERVAL).await;
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_entry() {
        let server = bind_ephemeral().await;
        let client_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let relay = MessageRelay::new(server);
        relay
            .send(client_addr, &Response::error(ErrorKind::InternalError), 0)
            .unwrap();
        assert_eq!(relay.pending_count(), 1);
        relay.tick(RETRY_INTERVAL).await;
        assert_eq!(relay.pending_count(), 0);
    }
}
