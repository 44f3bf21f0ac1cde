//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p engine_server -- [--config server.json]
//!
//! With no `--config`, [`ServerConfig::default`] is used. The server binds
//! its UDP socket (and, if `websocket_addr` is set, a WebSocket bridge),
//! opens the credentials database, and runs until the `end` console command
//! (when attached to a TTY) or SIGINT brings it down.

use std::env;

use anyhow::Context;
use engine_server::Dispatcher;
use engine_shared::config::ServerConfig;
use tracing::info;

fn parse_args() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                let contents = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read config file {}", args[i + 1]))?;
                return ServerConfig::from_json_str(&contents).context("parse config file");
            }
            _ => i += 1,
        }
    }
    Ok(ServerConfig::default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(bind_addr = %cfg.bind_addr, tps = cfg.tps, "starting server");

    let (dispatcher, websocket_inbound) = Dispatcher::bind(&cfg).await.context("bind dispatcher")?;
    dispatcher.spawn_actors();

    let shutdown = dispatcher.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            shutdown.request_shutdown();
        }
    });

    dispatcher.run(websocket_inbound).await;
    info!("server stopped");
    Ok(())
}
