//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- --addr 127.0.0.1:25555 --name dave --password hunter2 [--register]
//!
//! Drives the protocol interactively: logs in (registering first if
//! `--register` is passed), then reads commands from stdin. This is a
//! manual-testing tool, not a product surface.
//!
//! Console commands:
//!   move <x> <y>   - set velocity
//!   endmove        - zero velocity
//!   say <message>  - broadcast a chat message
//!   update         - request a full client-update snapshot
//!   quit           - log out and exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use engine_client::GameClient;
use engine_shared::config::ClientConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> (ClientConfig, bool) {
    let mut cfg = ClientConfig {
        server_addr: "127.0.0.1:25555".to_string(),
        username: "player".to_string(),
        password: "password".to_string(),
    };
    let mut register = false;
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.username = args[i + 1].clone();
                i += 2;
            }
            "--password" if i + 1 < args.len() => {
                cfg.password = args[i + 1].clone();
                i += 2;
            }
            "--register" => {
                register = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    (cfg, register)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (cfg, register) = parse_args();
    info!(server = %cfg.server_addr, name = %cfg.username, "starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;
    if register {
        client.register(&cfg.username, &cfg.password).await.context("register")?;
        println!("Registered as {}", cfg.username);
    }
    client.login(&cfg.username, &cfg.password).await.context("login")?;
    let session = client.session().expect("login populates session").clone();
    println!(
        "Logged in as {} (id {}), world {}x{} chunks of {}x{}",
        session.name,
        session.client_id,
        session.world_width,
        session.world_height,
        session.chunk_width,
        session.chunk_height
    );

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            line = console_rx.recv() => {
                let Some(line) = line else { break };
                let tokens: Vec<&str> = line.split_whitespace().collect();
                let result = match tokens.as_slice() {
                    ["move", x, y] => match (x.parse(), y.parse()) {
                        (Ok(x), Ok(y)) => client.move_to(x, y).await,
                        _ => { println!("usage: move <x> <y>"); continue; }
                    },
                    ["endmove"] => client.end_move().await,
                    ["update"] => client.request_update().await,
                    ["say", ..] => client.send_message(&tokens[1..].join(" ")).await,
                    ["quit"] => {
                        let _ = client.logout().await;
                        break;
                    }
                    _ => { println!("unknown command: {line}"); continue; }
                };
                if let Err(e) = result {
                    println!("error: {e}");
                }
            }
            response = client.recv_response() => {
                match response {
                    Ok(response) => println!("{}", serde_json::to_string(&response).unwrap_or_default()),
                    Err(e) => println!("recv error: {e}"),
                }
            }
        }
    }

    Ok(())
}
