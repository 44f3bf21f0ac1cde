//! Wire protocol.
//!
//! Goals:
//! - One request envelope, one response envelope, both plain JSON.
//! - Keep the request/response kind set closed (an enum, not a string map).
//! - Keep serialization explicit so the wire shape is visible from the types.
//!
//! Datagrams are JSON objects, UTF-8 encoded, one per packet. The relay
//! (`crate::relay`) is responsible for stamping outbound payloads with
//! `packet-id`/`timestamp`; the types here model the payload body only.

use anyhow::Context;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a logged-in client. Stable for the lifetime of the session;
/// equal to the credential id stored in the `users` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new_unique() -> Self {
        ClientId(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chunk coordinate plus intra-chunk position, the shape every
/// position-bearing response carries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFields {
    #[serde(rename = "chunk-x")]
    pub chunk_x: i32,
    #[serde(rename = "chunk-y")]
    pub chunk_y: i32,
    pub x: i32,
    pub y: i32,
}

/// Request envelope: `{"request": <kind>, "session-id"?: <token>, ...}`.
///
/// `session_id` is flattened out of the same JSON object the kind is tagged
/// in, matching the wire shape; pre-auth requests (`obtain-public`,
/// `register`, `init-session`) simply omit it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RequestEnvelope {
    #[serde(rename = "session-id", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub kind: Request,
}

/// The closed set of request kinds the dispatcher understands.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum Request {
    ObtainPublic,
    Register {
        username: String,
        /// Base64 of the RSA ciphertext of the UTF-8 password.
        password: String,
    },
    InitSession {
        username: String,
        password: String,
    },
    EndSession,
    Confirm {
        #[serde(rename = "packet-id")]
        packet_id: String,
    },
    Ping,
    Move {
        x: f64,
        y: f64,
    },
    EndMove,
    Update,
    Message {
        message: String,
    },
}

/// Response envelope: `{"response": <kind>, ...}`. `packet-id`/`timestamp`
/// are added by the relay at send time, not modeled here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "response", rename_all = "kebab-case")]
pub enum Response {
    ConfirmPublic {
        #[serde(rename = "public-key")]
        public_key: String,
    },
    ClientJoined {
        id: ClientId,
        name: String,
        #[serde(flatten)]
        position: PositionFields,
    },
    ClientLeft {
        id: ClientId,
    },
    ClientUpdate {
        id: ClientId,
        name: String,
        #[serde(flatten)]
        position: PositionFields,
    },
    PositionUpdate {
        id: ClientId,
        #[serde(flatten)]
        position: PositionFields,
    },
    Message {
        origin: String,
        message: String,
    },
    Success {
        #[serde(flatten)]
        kind: SuccessKind,
    },
    Error {
        #[serde(flatten)]
        kind: ErrorKind,
    },
    Info {
        #[serde(flatten)]
        kind: InfoKind,
    },
}

/// `success/<type>` subtypes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SuccessKind {
    LoginSuccess {
        session: String,
        name: String,
        id: ClientId,
        #[serde(rename = "chunk-width")]
        chunk_width: i32,
        #[serde(rename = "chunk-height")]
        chunk_height: i32,
        #[serde(rename = "world-width")]
        world_width: i32,
        #[serde(rename = "world-height")]
        world_height: i32,
    },
    LogoutSuccess,
    RegisterSuccess,
}

/// `error/<code>` subtypes, the closed error-code set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ErrorKind {
    MalformedData,
    InvalidRequest,
    MissingData,
    IncorrectData,
    InvalidInfo,
    FailedDecrypt,
    UsernameInUse,
    UsernameIsEmpty,
    PasswordIsEmpty,
    AlreadyConnected,
    UserNotConnected,
    DataError,
    InternalError,
    InvalidPacketId,
}

/// `info/<type>` subtypes. Only `kicked` exists today, but the shape is a
/// tagged enum so a second kind doesn't force a response-level change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InfoKind {
    Kicked { message: String },
}

impl Response {
    /// Shorthand for the one `info/kicked` payload the dispatcher and the
    /// registry's kick upcall both send.
    pub fn kicked(message: impl Into<String>) -> Self {
        Response::Info {
            kind: InfoKind::Kicked {
                message: message.into(),
            },
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Response::Error { kind }
    }
}

/// Serializes any wire type to JSON bytes.
pub fn to_json_bytes<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(value).context("serialize json")
}

/// Deserializes any wire type from JSON bytes.
pub fn from_json_slice<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(bytes).context("deserialize json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_roundtrip_with_session() {
        let env = RequestEnvelope {
            session_id: Some("tok123".to_string()),
            kind: Request::Move { x: 10.0, y: 0.0 },
        };
        let bytes = to_json_bytes(&env).unwrap();
        let back: RequestEnvelope = from_json_slice(&bytes).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn request_envelope_roundtrip_without_session() {
        let env = RequestEnvelope {
            session_id: None,
            kind: Request::ObtainPublic,
        };
        let bytes = to_json_bytes(&env).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json.get("session-id").is_none());
        let back: RequestEnvelope = from_json_slice(&bytes).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn response_kind_tags_are_kebab_case() {
        let resp = Response::error(ErrorKind::UsernameInUse);
        let json: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["response"], "error");
        assert_eq!(json["type"], "username-in-use");
    }

    #[test]
    fn login_success_roundtrip() {
        let resp = Response::Success {
            kind: SuccessKind::LoginSuccess {
                session: "s".to_string(),
                name: "dave".to_string(),
                id: ClientId::new_unique(),
                chunk_width: 400,
                chunk_height: 400,
                world_width: 16,
                world_height: 16,
            },
        };
        let bytes = to_json_bytes(&resp).unwrap();
        let back: Response = from_json_slice(&bytes).unwrap();
        assert_eq!(resp, back);
    }
}
