//! Client Registry: the authoritative map of logged-in clients.
//!
//! Three indexes (id, lowercased name, session token) always reference the
//! same underlying client set. A single mutex guards all three; mutable
//! per-client fields (address, position, velocity, last-response) live
//! behind their own lock on the `Client` itself so a lookup can hand out an
//! `Arc<Client>` snapshot without holding the registry lock while the
//! caller reads or writes it.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, Instant},
};

use tracing::info;

use crate::math::{FVec2, IVec2};
use crate::net::{ClientId, PositionFields, Response};
use crate::relay::MessageRelay;

/// Default liveness timeout: a silent client is kicked after this long.
pub const DEFAULT_DC_TIME: Duration = Duration::from_secs(5 * 60);

struct ClientState {
    addr: SocketAddr,
    pos: IVec2,
    chunk: IVec2,
    vel: FVec2,
    last_response: Instant,
}

/// A logged-in player.
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub session: String,
    /// Construction-only: no setter exists. Mirrors the reference client's
    /// read-only `privilege_level` property.
    pub privilege_level: i32,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(
        id: ClientId,
        name: String,
        session: String,
        addr: SocketAddr,
        privilege_level: i32,
        spawn_chunk: IVec2,
        spawn_pos: IVec2,
    ) -> Self {
        Self {
            id,
            name,
            session,
            privilege_level,
            state: Mutex::new(ClientState {
                addr,
                pos: spawn_pos,
                chunk: spawn_chunk,
                vel: FVec2::ZERO,
                last_response: Instant::now(),
            }),
        }
    }

    /// The console's built-in operator identity, used as `executor` for
    /// commands typed at the server's own stdin — not a network peer.
    pub fn console_executor() -> Self {
        Self::new(
            ClientId::new_unique(),
            "SERVER".to_string(),
            String::new(),
            SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
            99,
            IVec2::ZERO,
            IVec2::ZERO,
        )
    }

    pub fn addr(&self) -> SocketAddr {
        self.state.lock().expect("client lock poisoned").addr
    }

    pub fn set_addr(&self, addr: SocketAddr) {
        self.state.lock().expect("client lock poisoned").addr = addr;
    }

    pub fn pos(&self) -> IVec2 {
        self.state.lock().expect("client lock poisoned").pos
    }

    pub fn chunk(&self) -> IVec2 {
        self.state.lock().expect("client lock poisoned").chunk
    }

    pub fn vel(&self) -> FVec2 {
        self.state.lock().expect("client lock poisoned").vel
    }

    pub fn set_vel(&self, vel: FVec2) {
        self.state.lock().expect("client lock poisoned").vel = vel;
    }

    /// Sets position and chunk together, as the world tick does after a
    /// successful migration.
    pub fn set_pos_chunk(&self, pos: IVec2, chunk: IVec2) {
        let mut state = self.state.lock().expect("client lock poisoned");
        state.pos = pos;
        state.chunk = chunk;
    }

    pub fn last_response_age(&self) -> Duration {
        self.state.lock().expect("client lock poisoned").last_response.elapsed()
    }

    pub fn touch(&self) {
        self.state.lock().expect("client lock poisoned").last_response = Instant::now();
    }

    pub fn position_fields(&self) -> PositionFields {
        let state = self.state.lock().expect("client lock poisoned");
        PositionFields {
            chunk_x: state.chunk.x,
            chunk_y: state.chunk.y,
            x: state.pos.x,
            y: state.pos.y,
        }
    }
}

/// Capability to send a response to every known client. Implemented by
/// [`ClientRegistry`]; consumed by the world simulation, which otherwise
/// would need to hold a registry reference directly (the cyclic
/// World-needs-Registry dependency this type exists to break).
pub trait Broadcaster: Send + Sync {
    /// Sends `response` to a single address.
    fn send_to(&self, addr: SocketAddr, response: &Response);
    /// Sends `response` to every currently-registered client.
    fn broadcast(&self, response: &Response);
}

/// Capability to enumerate currently-registered clients. Implemented by
/// [`ClientRegistry`]; consumed by the world simulation for `full_update`.
pub trait ClientSource: Send + Sync {
    fn snapshot(&self) -> Vec<Arc<Client>>;
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<ClientId, Arc<Client>>,
    by_name: HashMap<String, Arc<Client>>,
    by_session: HashMap<String, Arc<Client>>,
}

pub struct ClientRegistry {
    indexes: Mutex<Indexes>,
    relay: MessageRelay,
    dc_time: Duration,
    on_remove: OnceLock<Box<dyn Fn(ClientId) + Send + Sync>>,
}

impl ClientRegistry {
    pub fn new(relay: MessageRelay, dc_time: Duration) -> Self {
        Self {
            indexes: Mutex::new(Indexes::default()),
            relay,
            dc_time,
            on_remove: OnceLock::new(),
        }
    }

    /// Registers a callback invoked whenever a client leaves the registry
    /// through any path (logout, kick, liveness timeout), so the world's
    /// chunk membership stays in sync without the registry holding a
    /// `World` reference of its own. Set once by the dispatcher after both
    /// are constructed; a second call is a no-op.
    pub fn set_on_remove(&self, callback: impl Fn(ClientId) + Send + Sync + 'static) {
        let _ = self.on_remove.set(Box::new(callback));
    }

    /// Inserts `client` into all three indexes and broadcasts
    /// `client-joined`. Fails (returns `false`) if the lowercased name is
    /// already taken; otherwise always succeeds.
    pub fn add(&self, client: Arc<Client>) -> bool {
        let name_key = client.name.to_lowercase();
        {
            let mut indexes = self.indexes.lock().expect("registry lock poisoned");
            if indexes.by_name.contains_key(&name_key) {
                return false;
            }
            indexes.by_name.insert(name_key, client.clone());
            indexes.by_id.insert(client.id, client.clone());
            indexes.by_session.insert(client.session.clone(), client.clone());
        }
        info!(name = %client.name, id = %client.id, "client joined");
        self.broadcast(&Response::ClientJoined {
            id: client.id,
            name: client.name.clone(),
            position: client.position_fields(),
        });
        true
    }

    pub fn get_by_id(&self, id: ClientId) -> Option<Arc<Client>> {
        self.indexes.lock().expect("registry lock poisoned").by_id.get(&id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Client>> {
        self.indexes
            .lock()
            .expect("registry lock poisoned")
            .by_name
            .get(&name.to_lowercase())
            .cloned()
    }

    pub fn get_by_session(&self, session: &str) -> Option<Arc<Client>> {
        self.indexes
            .lock()
            .expect("registry lock poisoned")
            .by_session
            .get(session)
            .cloned()
    }

    /// Updates `last_response` for the client owning `session`. `false` if
    /// the session is unknown.
    pub fn update_timestamp_by_session(&self, session: &str) -> bool {
        match self.get_by_session(session) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    pub fn update_timestamp_by_name(&self, name: &str) -> bool {
        match self.get_by_name(name) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    pub fn update_timestamp_by_id(&self, id: ClientId) -> bool {
        match self.get_by_id(id) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    /// Removes the client owning `session` from all three indexes and
    /// broadcasts `client-left`. Idempotent: an unknown session is a
    /// no-op, and this always returns `true`.
    pub fn remove_by_session(&self, session: &str) -> bool {
        let removed = {
            let mut indexes = self.indexes.lock().expect("registry lock poisoned");
            indexes.by_session.remove(session)
        };
        if let Some(client) = removed {
            {
                let mut indexes = self.indexes.lock().expect("registry lock poisoned");
                indexes.by_id.remove(&client.id);
                indexes.by_name.remove(&client.name.to_lowercase());
            }
            info!(name = %client.name, id = %client.id, "client left");
            self.broadcast(&Response::ClientLeft { id: client.id });
            if let Some(hook) = self.on_remove.get() {
                hook(client.id);
            }
        }
        true
    }

    pub fn remove_by_name(&self, name: &str) -> bool {
        match self.get_by_name(name) {
            Some(client) => self.remove_by_session(&client.session),
            None => false,
        }
    }

    pub fn remove_by_id(&self, id: ClientId) -> bool {
        match self.get_by_id(id) {
            Some(client) => self.remove_by_session(&client.session),
            None => false,
        }
    }

    /// Sends a kicked notice to `client` then removes it. Idempotent
    /// against a client that's already gone.
    pub fn kick(&self, client: &Client, reason: &str) {
        let _ = self.relay.send_default(client.addr(), &Response::kicked(reason));
        self.remove_by_session(&client.session);
    }

    /// Name -> id snapshot, for the `listplayers` console command.
    pub fn list(&self) -> HashMap<String, ClientId> {
        self.indexes
            .lock()
            .expect("registry lock poisoned")
            .by_name
            .iter()
            .map(|(name, client)| (name.clone(), client.id))
            .collect()
    }

    /// Scans for clients past `dc_time` and kicks them. Intended to be
    /// driven by a loop on a short, non-critical cadence.
    pub fn sweep_once(&self) {
        for client in self.snapshot() {
            if client.last_response_age() > self.dc_time {
                self.kick(&client, "Session timed out.");
            }
        }
    }
}

impl Broadcaster for ClientRegistry {
    fn send_to(&self, addr: SocketAddr, response: &Response) {
        let _ = self.relay.send_default(addr, response);
    }

    fn broadcast(&self, response: &Response) {
        let addrs: Vec<SocketAddr> = {
            let indexes = self.indexes.lock().expect("registry lock poisoned");
            indexes.by_id.values().map(|c| c.addr()).collect()
        };
        for addr in addrs {
            let _ = self.relay.send_default(addr, response);
        }
    }
}

impl ClientSource for ClientRegistry {
    fn snapshot(&self) -> Vec<Arc<Client>> {
        self.indexes.lock().expect("registry lock poisoned").by_id.values().cloned().collect()
    }
}

/// Drives [`ClientRegistry::sweep_once`] on a tight loop, matching the
/// reference client handler's `while self.running: update_all();
/// sleep(0.0001)`.
pub async fn run_liveness_loop(registry: Arc<ClientRegistry>, running: Arc<std::sync::atomic::AtomicBool>) {
    while running.load(std::sync::atomic::Ordering::Relaxed) {
        registry.sweep_once();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn registry() -> ClientRegistry {
        let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_socket.set_nonblocking(true).unwrap();
        let socket = tokio::net::UdpSocket::from_std(std_socket).unwrap();
        ClientRegistry::new(MessageRelay::new(Arc::new(socket)), DEFAULT_DC_TIME)
    }

    fn client(name: &str, port: u16) -> Arc<Client> {
        Arc::new(Client::new(
            ClientId::new_unique(),
            name.to_string(),
            format!("session-{name}"),
            addr(port),
            0,
            IVec2::ZERO,
            IVec2::ZERO,
        ))
    }

    #[tokio::test]
    async fn add_rejects_duplicate_name_case_insensitive() {
        let reg = registry();
        assert!(reg.add(client("Dave", 1)));
        assert!(!reg.add(client("dave", 2)));
    }

    #[tokio::test]
    async fn all_three_indexes_agree() {
        let reg = registry();
        let c = client("Alice", 1);
        reg.add(c.clone());
        assert_eq!(reg.get_by_id(c.id).unwrap().id, c.id);
        assert_eq!(reg.get_by_name("ALICE").unwrap().id, c.id);
        assert_eq!(reg.get_by_session(&c.session).unwrap().id, c.id);
    }

    #[tokio::test]
    async fn remove_by_session_is_idempotent() {
        let reg = registry();
        let c = client("Bob", 1);
        reg.add(c.clone());
        assert!(reg.remove_by_session(&c.session));
        assert!(reg.remove_by_session(&c.session));
        assert!(reg.get_by_id(c.id).is_none());
    }

    #[tokio::test]
    async fn sweep_kicks_stale_clients() {
        let reg = registry();
        let c = client("Carol", 1);
        reg.add(c.clone());
        // Force staleness without sleeping the test thread.
        c.state.lock().unwrap().last_response = Instant::now() - Duration::from_secs(600);
        reg.sweep_once();
        assert!(reg.get_by_id(c.id).is_none());
    }

    #[tokio::test]
    async fn kick_runs_the_on_remove_hook_like_any_other_removal() {
        let reg = registry();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let removed_clone = removed.clone();
        reg.set_on_remove(move |id| removed_clone.lock().unwrap().push(id));

        let c = client("Dan", 1);
        reg.add(c.clone());
        reg.kick(&c, "testing");

        assert_eq!(removed.lock().unwrap().as_slice(), &[c.id]);
    }
}
