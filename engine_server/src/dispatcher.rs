//! Server Dispatcher: the UDP receive loop, request table, and RSA/bcrypt
//! login protocol tying the shared relay/registry/world/auth/db modules
//! together.
//!
//! One struct owns every long-lived resource, constructed once at startup
//! and driving a handful of cooperating `tokio::spawn`ed actors off a
//! shared `running` flag. The request table itself is a closed match over
//! `engine_shared::net::Request`'s variants rather than the reference
//! server's `dict[str, Callable]` — one handler per kind, unknown kinds
//! never reach it (rejected at decode time, see `handle_datagram`).

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use engine_shared::{
    auth::{self, ServerKeypair},
    config::ServerConfig,
    console::{CommandProcessor, ConsoleCapabilities},
    db::CredentialsStore,
    math::{FVec2, IVec2},
    net::{ClientId, ErrorKind, Request, Response, SuccessKind},
    registry::{Broadcaster, Client, ClientRegistry},
    relay::{self, MessageRelay, NoWebSocketPeers},
    world::{self, World},
};
use tokio::net::UdpSocket;

use crate::websocket::WebSocketBridge;

/// Datagrams larger than this are dropped unread, matching the reference
/// server's `recvfrom(1024)`.
const MAX_DATAGRAM: usize = 1024;

/// The kebab-case tags `Request` accepts, used only to tell an unrecognized
/// `request` value (`invalid-request`) apart from a recognized one whose
/// fields didn't deserialize (`missing-data`) once the structural decode
/// below has already succeeded.
const KNOWN_REQUEST_TAGS: &[&str] = &[
    "obtain-public",
    "register",
    "init-session",
    "end-session",
    "confirm",
    "ping",
    "move",
    "end-move",
    "update",
    "message",
];

/// A decode-stage failure: malformed JSON, not an object, or no `request`
/// field — the only case that can't distinguish `invalid-request` from
/// `missing-data`, since neither `request`'s tag nor a `session-id` for the
/// liveness piggyback could be read at all.
struct DecodeError;

/// The structural shell every datagram must have before the session-liveness
/// piggyback check and the typed `Request` decode can run: a JSON object
/// carrying at least a `request` tag. `value` still holds the whole object,
/// re-parsed into `Request` only after the piggyback check passes, matching
/// the reference server's request-table lookup running after that check.
struct Envelope {
    session_id: Option<String>,
    request_tag: String,
    value: Value,
}

fn decode_envelope(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|_| DecodeError)?;
    if !value.is_object() {
        return Err(DecodeError);
    }
    let request_tag = value
        .get("request")
        .and_then(Value::as_str)
        .ok_or(DecodeError)?
        .to_string();
    let session_id = value
        .get("session-id")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Envelope {
        session_id,
        request_tag,
        value,
    })
}

/// Everything the request table touches: the socket/relay pair, the
/// registry and world (wired together explicitly here rather than either
/// holding the other), the per-run RSA keypair, and the single credentials
/// connection.
pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    relay: MessageRelay,
    registry: Arc<ClientRegistry>,
    world: Arc<World>,
    keypair: ServerKeypair,
    db: Mutex<CredentialsStore>,
    running: Arc<AtomicBool>,
    console_executor: Client,
    local_addr: SocketAddr,
    websocket_addr: Option<SocketAddr>,
    bridge: Option<Arc<WebSocketBridge>>,
    inbound_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
}

impl Dispatcher {
    /// Binds the UDP socket (and, if configured, the WebSocket bridge's
    /// listener address), opens the credentials database, and wires the
    /// registry and world together. Returns the dispatcher plus the
    /// WebSocket inbound channel's receiving half, so `run` can select over
    /// both transports.
    pub async fn bind(
        cfg: &ServerConfig,
    ) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<(Vec<u8>, SocketAddr)>)> {
        let socket = Arc::new(
            UdpSocket::bind(&cfg.bind_addr)
                .await
                .with_context(|| format!("bind udp socket at {}", cfg.bind_addr))?,
        );
        let local_addr = socket.local_addr().context("read local addr")?;

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let websocket_addr: Option<SocketAddr> = cfg
            .websocket_addr
            .as_ref()
            .map(|addr| addr.parse())
            .transpose()
            .context("parse websocket_addr")?;

        let bridge = websocket_addr.map(|_| WebSocketBridge::new());
        let relay = match &bridge {
            Some(bridge) => MessageRelay::with_websocket_and_retries(socket.clone(), bridge.clone(), cfg.max_retries),
            None => MessageRelay::with_websocket_and_retries(socket.clone(), Arc::new(NoWebSocketPeers), cfg.max_retries),
        };

        let dc_time = std::time::Duration::from_secs(cfg.dc_time_secs);
        let registry = Arc::new(ClientRegistry::new(relay.clone(), dc_time));
        let broadcaster: Arc<dyn Broadcaster> = registry.clone();
        let world = Arc::new(World::new(
            cfg.world_width,
            cfg.world_height,
            cfg.chunk_width,
            cfg.chunk_height,
            cfg.tps,
            broadcaster,
        ));

        let world_for_removal = world.clone();
        registry.set_on_remove(move |id| world_for_removal.remove_client(id));

        let keypair = ServerKeypair::generate().context("generate rsa keypair")?;
        let db = CredentialsStore::open(&cfg.db_path).context("open credentials database")?;

        let dispatcher = Arc::new(Self {
            socket,
            relay,
            registry,
            world,
            keypair,
            db: Mutex::new(db),
            running: Arc::new(AtomicBool::new(true)),
            console_executor: Client::console_executor(),
            local_addr,
            websocket_addr,
            bridge,
            inbound_tx,
        });

        Ok((dispatcher, inbound_rx))
    }

    /// Spawns the relay retry loop, the registry sweeper, the world tick
    /// loop, the console input loop, and (if configured) the WebSocket
    /// bridge's accept loop. Does not spawn the receive loop itself — call
    /// `run` for that, after spawning these.
    pub fn spawn_actors(self: &Arc<Self>) {
        tokio::spawn(relay::run_retry_loop(self.relay.clone(), self.running.clone()));
        tokio::spawn(engine_shared::registry::run_liveness_loop(
            self.registry.clone(),
            self.running.clone(),
        ));
        tokio::spawn(world::run_tick_loop(self.world.clone(), self.running.clone()));

        let this = self.clone();
        tokio::spawn(async move { this.run_console_loop().await });

        if let (Some(addr), Some(bridge)) = (self.websocket_addr, self.bridge.clone()) {
            let running = self.running.clone();
            let inbound_tx = self.inbound_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.serve(addr, inbound_tx, running).await {
                    warn!(error = %e, "websocket bridge stopped");
                }
            });
        }
    }

    /// The address the UDP socket actually bound to; useful when `bind_addr`
    /// asked for an ephemeral port (`:0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flips `running` off and unblocks a pending `recv_from` with a
    /// loopback datagram. Used both by the `end` console command and by the
    /// binary's own signal handler.
    pub fn request_shutdown(&self) {
        info!("shutdown requested");
        self.running.store(false, Ordering::Relaxed);
        let socket = self.socket.clone();
        let addr = self.local_addr;
        tokio::spawn(async move {
            let _ = socket.send_to(br#"{"request":"confirm"}"#, addr).await;
        });
    }

    /// The UDP + (optional) WebSocket receive loop. Runs until `running`
    /// clears; shutdown unblocks a pending `recv_from` by sending a
    /// loopback datagram to `local_addr`, mirroring `close_server`'s dummy
    /// `sendto` in the reference implementation.
    pub async fn run(self: Arc<Self>, mut websocket_inbound: mpsc::Receiver<(Vec<u8>, SocketAddr)>) {
        let mut buf = [0u8; MAX_DATAGRAM];
        while self.running.load(Ordering::Relaxed) {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, addr)) if n > 0 => self.clone().handle_datagram(buf[..n].to_vec(), addr).await,
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "udp recv failed"),
                    }
                }
                Some((data, addr)) = websocket_inbound.recv() => {
                    self.clone().handle_datagram(data, addr).await;
                }
            }
        }
    }

    async fn handle_datagram(self: Arc<Self>, data: Vec<u8>, addr: SocketAddr) {
        let envelope = match decode_envelope(&data) {
            Ok(envelope) => envelope,
            Err(DecodeError) => {
                self.reply(addr, &Response::error(ErrorKind::MalformedData));
                return;
            }
        };

        if let Some(session_id) = &envelope.session_id {
            if !self.registry.update_timestamp_by_session(session_id) {
                self.reply(addr, &Response::kicked("You were not connected to the server."));
                return;
            }
        }

        let request: Request = match serde_json::from_value(envelope.value) {
            Ok(request) => request,
            Err(_) => {
                let kind = if KNOWN_REQUEST_TAGS.contains(&envelope.request_tag.as_str()) {
                    ErrorKind::MissingData
                } else {
                    ErrorKind::InvalidRequest
                };
                self.reply(addr, &Response::error(kind));
                return;
            }
        };

        let outcome = self.dispatch(addr, envelope.session_id.as_deref(), request).await;
        if let Err(e) = outcome {
            warn!(error = %e, request = %envelope.request_tag, "handler failed");
            self.reply(addr, &Response::error(ErrorKind::InternalError));
        }
    }

    async fn dispatch(
        &self,
        addr: SocketAddr,
        session_id: Option<&str>,
        request: Request,
    ) -> anyhow::Result<bool> {
        match request {
            Request::ObtainPublic => self.handle_obtain_public(addr),
            Request::Register { username, password } => self.handle_register(addr, username, password),
            Request::InitSession { username, password } => self.handle_init_session(addr, username, password),
            Request::EndSession => self.handle_end_session(addr, session_id),
            Request::Confirm { packet_id } => Ok(self.handle_confirm(addr, &packet_id)),
            Request::Ping => Ok(false),
            Request::Move { x, y } => self.handle_move(addr, session_id, x, y),
            Request::EndMove => self.handle_end_move(addr, session_id),
            Request::Update => self.handle_update(addr, session_id),
            Request::Message { message } => self.handle_message(addr, session_id, message),
        }
    }

    fn reply(&self, addr: SocketAddr, response: &Response) {
        if let Err(e) = self.relay.send_default(addr, response) {
            warn!(%addr, error = %e, "failed to enqueue response");
        }
    }

    fn handle_obtain_public(&self, addr: SocketAddr) -> anyhow::Result<bool> {
        let public_key = self.keypair.public_key_pem()?;
        self.reply(addr, &Response::ConfirmPublic { public_key });
        Ok(true)
    }

    fn handle_register(&self, addr: SocketAddr, username: String, password_b64: String) -> anyhow::Result<bool> {
        if username.trim().is_empty() {
            self.reply(addr, &Response::error(ErrorKind::UsernameIsEmpty));
            return Ok(false);
        }

        let exists = {
            let db = self.db.lock().expect("db lock poisoned");
            db.username_exists(&username)?
        };
        if exists {
            self.reply(addr, &Response::error(ErrorKind::UsernameInUse));
            return Ok(false);
        }

        let password = match self.keypair.decrypt_password(&password_b64) {
            Ok(password) => password,
            Err(_) => {
                self.reply(addr, &Response::error(ErrorKind::FailedDecrypt));
                return Ok(false);
            }
        };
        if password.trim().is_empty() {
            self.reply(addr, &Response::error(ErrorKind::PasswordIsEmpty));
            return Ok(false);
        }

        let hash = auth::hash_password(&password)?;
        let registered = {
            let mut db = self.db.lock().expect("db lock poisoned");
            db.register(&username, &hash)
        };
        match registered {
            Ok(_id) => {
                self.reply(
                    addr,
                    &Response::Success {
                        kind: SuccessKind::RegisterSuccess,
                    },
                );
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "register transaction failed");
                self.reply(addr, &Response::error(ErrorKind::DataError));
                Ok(false)
            }
        }
    }

    fn handle_init_session(&self, addr: SocketAddr, username: String, password_b64: String) -> anyhow::Result<bool> {
        let hash = {
            let db = self.db.lock().expect("db lock poisoned");
            db.password_hash(&username)?
        };
        let Some(hash) = hash else {
            self.reply(addr, &Response::error(ErrorKind::InvalidInfo));
            return Ok(false);
        };

        let password = match self.keypair.decrypt_password(&password_b64) {
            Ok(password) => password,
            Err(_) => {
                self.reply(addr, &Response::error(ErrorKind::FailedDecrypt));
                return Ok(false);
            }
        };

        if !auth::verify_password(&password, &hash)? {
            self.reply(addr, &Response::error(ErrorKind::InvalidInfo));
            return Ok(false);
        }

        // A name already connected from a different remote host is refused;
        // the same host reconnecting (e.g. after a network blip) just
        // refreshes its address, matching `init_session`'s `login is False`
        // branch.
        if let Some(existing) = self.registry.get_by_name(&username) {
            if existing.addr().ip() != addr.ip() {
                self.reply(addr, &Response::error(ErrorKind::AlreadyConnected));
                return Ok(false);
            }
            existing.set_addr(addr);
            self.reply_login_success(addr, &existing);
            return Ok(true);
        }

        let user_id = {
            let db = self.db.lock().expect("db lock poisoned");
            db.user_id(&username)?
        }
        .context("password hash existed but user row vanished")?;
        let privilege_level = {
            let mut db = self.db.lock().expect("db lock poisoned");
            db.privilege_level_or_default(user_id)?
        };

        let session = auth::generate_session_token();
        let client = Arc::new(Client::new(
            ClientId(user_id),
            username,
            session,
            addr,
            privilege_level,
            IVec2::ZERO,
            IVec2::ZERO,
        ));
        if !self.registry.add(client.clone()) {
            self.reply(addr, &Response::error(ErrorKind::AlreadyConnected));
            return Ok(false);
        }
        self.world.add_client(client.clone());
        self.reply_login_success(addr, &client);
        Ok(true)
    }

    fn reply_login_success(&self, addr: SocketAddr, client: &Client) {
        self.reply(
            addr,
            &Response::Success {
                kind: SuccessKind::LoginSuccess {
                    session: client.session.clone(),
                    name: client.name.clone(),
                    id: client.id,
                    chunk_width: self.world.chunk_width,
                    chunk_height: self.world.chunk_height,
                    world_width: self.world.width,
                    world_height: self.world.height,
                },
            },
        );
    }

    fn handle_end_session(&self, addr: SocketAddr, session_id: Option<&str>) -> anyhow::Result<bool> {
        let Some(session_id) = session_id else {
            self.reply(addr, &Response::error(ErrorKind::MissingData));
            return Ok(false);
        };
        match self.registry.get_by_session(session_id) {
            Some(_) => {
                // `remove_by_session`'s on-remove hook drops the client from
                // the world's chunk set, the same as the kick and
                // liveness-timeout paths.
                self.registry.remove_by_session(session_id);
                self.reply(
                    addr,
                    &Response::Success {
                        kind: SuccessKind::LogoutSuccess,
                    },
                );
                Ok(true)
            }
            None => {
                self.reply(addr, &Response::error(ErrorKind::UserNotConnected));
                Ok(false)
            }
        }
    }

    fn handle_confirm(&self, addr: SocketAddr, packet_id: &str) -> bool {
        match Uuid::parse_str(packet_id) {
            Ok(packet_id) => self.relay.confirm(packet_id),
            Err(_) => {
                self.reply(addr, &Response::error(ErrorKind::InvalidPacketId));
                false
            }
        }
    }

    fn handle_move(&self, addr: SocketAddr, session_id: Option<&str>, x: f64, y: f64) -> anyhow::Result<bool> {
        let Some(session_id) = session_id else {
            self.reply(addr, &Response::error(ErrorKind::MissingData));
            return Ok(false);
        };
        let client = self
            .registry
            .get_by_session(session_id)
            .context("session vanished between liveness piggyback and handler")?;
        client.set_vel(FVec2::new(x, y));
        Ok(true)
    }

    fn handle_end_move(&self, addr: SocketAddr, session_id: Option<&str>) -> anyhow::Result<bool> {
        let Some(session_id) = session_id else {
            self.reply(addr, &Response::error(ErrorKind::MissingData));
            return Ok(false);
        };
        let client = self
            .registry
            .get_by_session(session_id)
            .context("session vanished between liveness piggyback and handler")?;
        client.set_vel(FVec2::ZERO);
        Ok(true)
    }

    fn handle_update(&self, addr: SocketAddr, session_id: Option<&str>) -> anyhow::Result<bool> {
        let Some(session_id) = session_id else {
            self.reply(addr, &Response::error(ErrorKind::MissingData));
            return Ok(false);
        };
        self.registry
            .get_by_session(session_id)
            .context("session vanished between liveness piggyback and handler")?;
        self.world.full_update(addr);
        Ok(true)
    }

    fn handle_message(&self, addr: SocketAddr, session_id: Option<&str>, message: String) -> anyhow::Result<bool> {
        let Some(session_id) = session_id else {
            self.reply(addr, &Response::error(ErrorKind::MissingData));
            return Ok(false);
        };
        if message.trim().is_empty() {
            return Ok(false);
        }
        let Some(client) = self.registry.get_by_session(session_id) else {
            self.reply(addr, &Response::error(ErrorKind::IncorrectData));
            return Ok(false);
        };

        let inserted = {
            let mut db = self.db.lock().expect("db lock poisoned");
            db.insert_message(&message, client.id.0)
        };
        if let Err(e) = inserted {
            warn!(error = %e, "message insert failed");
            self.reply(addr, &Response::error(ErrorKind::DataError));
            return Ok(false);
        }

        self.registry.broadcast(&Response::Message {
            origin: client.id.to_string(),
            message,
        });
        Ok(true)
    }

    async fn run_console_loop(self: Arc<Self>) {
        use std::io::IsTerminal;
        if !std::io::stdin().is_terminal() {
            return;
        }
        let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
        std::thread::spawn(move || {
            use std::io::BufRead;
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line_tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });

        let caps = DispatcherCapabilities {
            dispatcher: self.clone(),
        };
        let mut commands = CommandProcessor::with_builtins();
        while self.running.load(Ordering::Relaxed) {
            tokio::select! {
                line = line_rx.recv() => {
                    let Some(line) = line else { break };
                    match commands.parse_command(&line, &self.console_executor, &caps) {
                        Ok(output) => output.iter().for_each(|l| println!("{l}")),
                        Err(_) => println!("Invalid Command. type `commands` for a list of commands."),
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)), if self.running.load(Ordering::Relaxed) => {}
            }
        }
    }
}

/// Bridges the command console to the dispatcher's lifecycle controls,
/// replacing the reference implementation's `get_server_thread()` global.
struct DispatcherCapabilities {
    dispatcher: Arc<Dispatcher>,
}

impl ConsoleCapabilities for DispatcherCapabilities {
    fn list_players(&self) -> HashMap<String, ClientId> {
        self.dispatcher.registry.list()
    }

    fn kick_player(&self, name: &str, reason: &str) -> bool {
        match self.dispatcher.registry.get_by_name(name) {
            Some(client) => {
                self.dispatcher.registry.kick(&client, reason);
                true
            }
            None => false,
        }
    }

    fn waiting_packet_ids(&self) -> Vec<Uuid> {
        self.dispatcher.relay.waiting_ids()
    }

    fn request_shutdown(&self) {
        self.dispatcher.request_shutdown();
    }
}
