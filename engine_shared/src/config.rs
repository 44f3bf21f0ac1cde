//! Configuration.
//!
//! Loads server/client configuration from JSON strings (file IO left to the
//! binary crates).

use serde::{Deserialize, Serialize};

/// Root server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP listen address, e.g. `0.0.0.0:25555`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// World grid width, in chunks.
    #[serde(default = "default_world_width")]
    pub world_width: i32,
    /// World grid height, in chunks.
    #[serde(default = "default_world_height")]
    pub world_height: i32,
    /// Intra-chunk extent on the x axis.
    #[serde(default = "default_chunk_extent")]
    pub chunk_width: i32,
    /// Intra-chunk extent on the y axis.
    #[serde(default = "default_chunk_extent")]
    pub chunk_height: i32,
    /// World simulation tick rate.
    #[serde(default = "default_tps")]
    pub tps: u32,
    /// Liveness timeout, in seconds, before a silent client is kicked.
    #[serde(default = "default_dc_time_secs")]
    pub dc_time_secs: u64,
    /// Path to the SQLite credentials database.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Default retry budget for relay sends.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Optional WebSocket bridge listen address; `None` disables it.
    #[serde(default)]
    pub websocket_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:25555".to_string()
}

fn default_world_width() -> i32 {
    64
}

fn default_world_height() -> i32 {
    64
}

fn default_chunk_extent() -> i32 {
    400
}

fn default_tps() -> u32 {
    20
}

fn default_dc_time_secs() -> u64 {
    5 * 60
}

fn default_db_path() -> String {
    "data.db".to_string()
}

fn default_max_retries() -> u32 {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            world_width: default_world_width(),
            world_height: default_world_height(),
            chunk_width: default_chunk_extent(),
            chunk_height: default_chunk_extent(),
            tps: default_tps(),
            dc_time_secs: default_dc_time_secs(),
            db_path: default_db_path(),
            max_retries: default_max_retries(),
            websocket_addr: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Minimal client-side configuration for the CLI client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_addr: String,
    pub username: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_object() {
        let cfg = ServerConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.tps, 20);
        assert_eq!(cfg.chunk_width, 400);
    }

    #[test]
    fn overrides_apply() {
        let cfg = ServerConfig::from_json_str(r#"{"tps": 30, "world_width": 8}"#).unwrap();
        assert_eq!(cfg.tps, 30);
        assert_eq!(cfg.world_width, 8);
        assert_eq!(cfg.world_height, 64);
    }
}
