//! `engine_shared`
//!
//! Shared libraries used by both client and server: math, the wire
//! protocol, the reliable datagram relay, the client registry, the world
//! simulation, password/session auth, and the credentials store.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns.
//! - Traits at the seams that would otherwise be cyclic references.
//! - No `unsafe`.

pub mod auth;
pub mod config;
pub mod console;
pub mod db;
pub mod math;
pub mod net;
pub mod registry;
pub mod relay;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::registry::{Broadcaster, Client, ClientRegistry, ClientSource};
    pub use crate::relay::MessageRelay;
    pub use crate::world::World;
}
