//! `engine_server`
//!
//! Server-side systems:
//! - UDP receive loop and request dispatch (`dispatcher`)
//! - Optional WebSocket bridge for browser-based clients (`websocket`)
//!
//! Everything else — the registry, world simulation, relay, auth, and
//! credentials store — lives in `engine_shared` and is shared with the
//! client crate.

pub mod dispatcher;
pub mod websocket;

pub use dispatcher::Dispatcher;
