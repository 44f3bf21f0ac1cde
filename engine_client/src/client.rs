//! Client implementation.
//!
//! Speaks the dispatcher's protocol directly over a connected UDP socket.
//! Every inbound datagram carrying a `packet-id` is acknowledged immediately
//! with `{"request":"confirm","packet-id":...}`, mirroring the relay's
//! send/confirm contract from the other side of the wire.

use std::net::SocketAddr;

use anyhow::{bail, Context};
use engine_shared::{
    config::ClientConfig,
    net::{to_json_bytes, ClientId, Request, RequestEnvelope, Response, SuccessKind},
};
use rand::rngs::OsRng;
use rsa::{pkcs1::DecodeRsaPublicKey, Pkcs1v15Encrypt, RsaPublicKey};
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// State established once `init-session` succeeds. Needed for every
/// request past login (`session_id`) and for interpreting position fields
/// the server sends (`chunk_width`/`chunk_height`).
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub client_id: ClientId,
    pub name: String,
    pub chunk_width: i32,
    pub chunk_height: i32,
    pub world_width: i32,
    pub world_height: i32,
}

/// A connected client. Request methods are request/response pairs: each
/// sends one datagram and waits for the matching reply, acknowledging it
/// along the way. Broadcasts (chat, join/leave, position updates) arrive
/// unprompted and are surfaced the same way through [`GameClient::recv_response`].
pub struct GameClient {
    socket: UdpSocket,
    session: Option<Session>,
}

impl GameClient {
    /// Binds an ephemeral UDP socket and connects it to `cfg.server_addr`,
    /// so `send`/`recv` can be used without naming the peer each time.
    pub async fn connect(cfg: &ClientConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let socket = UdpSocket::bind("0.0.0.0:0").await.context("bind udp socket")?;
        socket.connect(server_addr).await.context("connect to server")?;
        info!(%server_addr, "connected");
        Ok(Self { socket, session: None })
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    async fn send_request(&self, session_id: Option<String>, kind: Request) -> anyhow::Result<()> {
        let envelope = RequestEnvelope { session_id, kind };
        let bytes = to_json_bytes(&envelope)?;
        self.socket.send(&bytes).await.context("send datagram")?;
        Ok(())
    }

    /// Waits for the next datagram and decodes it as a [`Response`],
    /// acknowledging its `packet-id` first if it carries one.
    pub async fn recv_response(&self) -> anyhow::Result<Response> {
        let mut buf = [0u8; 2048];
        let n = self.socket.recv(&mut buf).await.context("recv datagram")?;
        let value: serde_json::Value =
            serde_json::from_slice(&buf[..n]).context("parse response json")?;
        if let Some(packet_id) = value.get("packet-id").and_then(|v| v.as_str()) {
            let confirm = Request::Confirm {
                packet_id: packet_id.to_string(),
            };
            let session_id = self.session.as_ref().map(|s| s.session_id.clone());
            self.send_request(session_id, confirm).await?;
        }
        serde_json::from_value(value).context("decode response")
    }

    /// Fetches and parses the server's per-run RSA public key.
    pub async fn obtain_public_key(&self) -> anyhow::Result<RsaPublicKey> {
        self.send_request(None, Request::ObtainPublic).await?;
        loop {
            match self.recv_response().await? {
                Response::ConfirmPublic { public_key } => {
                    return RsaPublicKey::from_pkcs1_pem(&public_key)
                        .context("parse server public key");
                }
                other => warn!(?other, "unexpected response while awaiting public key"),
            }
        }
    }

    fn encrypt_password(public_key: &RsaPublicKey, password: &str) -> anyhow::Result<String> {
        let ciphertext = public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, password.as_bytes())
            .context("encrypt password")?;
        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            ciphertext,
        ))
    }

    /// Registers a new account. Does not log in.
    pub async fn register(&self, username: &str, password: &str) -> anyhow::Result<()> {
        let public_key = self.obtain_public_key().await?;
        let password = Self::encrypt_password(&public_key, password)?;
        self.send_request(
            None,
            Request::Register {
                username: username.to_string(),
                password,
            },
        )
        .await?;
        match self.recv_response().await? {
            Response::Success {
                kind: SuccessKind::RegisterSuccess,
            } => Ok(()),
            Response::Error { kind } => bail!("register failed: {kind:?}"),
            other => bail!("unexpected response to register: {other:?}"),
        }
    }

    /// Logs in, storing the resulting session for subsequent requests.
    pub async fn login(&mut self, username: &str, password: &str) -> anyhow::Result<()> {
        let public_key = self.obtain_public_key().await?;
        let password = Self::encrypt_password(&public_key, password)?;
        self.send_request(
            None,
            Request::InitSession {
                username: username.to_string(),
                password,
            },
        )
        .await?;
        match self.recv_response().await? {
            Response::Success {
                kind:
                    SuccessKind::LoginSuccess {
                        session,
                        name,
                        id,
                        chunk_width,
                        chunk_height,
                        world_width,
                        world_height,
                    },
            } => {
                info!(%name, "logged in");
                self.session = Some(Session {
                    session_id: session,
                    client_id: id,
                    name,
                    chunk_width,
                    chunk_height,
                    world_width,
                    world_height,
                });
                Ok(())
            }
            Response::Error { kind } => bail!("login failed: {kind:?}"),
            other => bail!("unexpected response to login: {other:?}"),
        }
    }

    fn session_id(&self) -> anyhow::Result<String> {
        self.session
            .as_ref()
            .map(|s| s.session_id.clone())
            .context("not logged in")
    }

    pub async fn move_to(&self, x: f64, y: f64) -> anyhow::Result<()> {
        let session_id = self.session_id()?;
        self.send_request(Some(session_id), Request::Move { x, y }).await
    }

    pub async fn end_move(&self) -> anyhow::Result<()> {
        let session_id = self.session_id()?;
        self.send_request(Some(session_id), Request::EndMove).await
    }

    pub async fn send_message(&self, message: &str) -> anyhow::Result<()> {
        let session_id = self.session_id()?;
        self.send_request(
            Some(session_id),
            Request::Message {
                message: message.to_string(),
            },
        )
        .await
    }

    /// Asks the server for a full `client-update` snapshot of every
    /// currently-registered client.
    pub async fn request_update(&self) -> anyhow::Result<()> {
        let session_id = self.session_id()?;
        self.send_request(Some(session_id), Request::Update).await
    }

    pub async fn logout(&mut self) -> anyhow::Result<()> {
        let session_id = self.session_id()?;
        self.send_request(Some(session_id), Request::EndSession).await?;
        match self.recv_response().await? {
            Response::Success {
                kind: SuccessKind::LogoutSuccess,
            } => {
                self.session = None;
                Ok(())
            }
            Response::Error { kind } => bail!("logout failed: {kind:?}"),
            other => bail!("unexpected response to logout: {other:?}"),
        }
    }
}
