//! Shared test harness: spawns a dispatcher bound to an ephemeral port with
//! an in-memory credentials database.

use std::sync::Arc;

use engine_server::Dispatcher;
use engine_shared::config::{ClientConfig, ServerConfig};

pub async fn spawn_server() -> anyhow::Result<Arc<Dispatcher>> {
    let cfg = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        db_path: ":memory:".to_string(),
        ..ServerConfig::default()
    };
    let (dispatcher, inbound) = Dispatcher::bind(&cfg).await?;
    dispatcher.spawn_actors();
    let running = dispatcher.clone();
    tokio::spawn(async move { running.run(inbound).await });
    Ok(dispatcher)
}

pub fn client_config(dispatcher: &Dispatcher, username: &str, password: &str) -> ClientConfig {
    ClientConfig {
        server_addr: dispatcher.local_addr().to_string(),
        username: username.to_string(),
        password: password.to_string(),
    }
}

/// A name unique enough to use as a username within a single test.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}
