//! `engine_client`
//!
//! A minimal client for the chunked-world UDP protocol: register/log in,
//! move, chat, and print whatever the dispatcher broadcasts back. This
//! exists to drive manual and integration testing of the protocol, not as a
//! product surface in its own right.

pub mod client;

pub use client::{GameClient, Session};
