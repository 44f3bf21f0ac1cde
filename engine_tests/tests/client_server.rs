//! End-to-end protocol scenarios, run against a real dispatcher bound to an
//! ephemeral UDP port.

mod common;

use std::time::Duration;

use engine_client::GameClient;
use engine_shared::net::{ErrorKind, Response};
use tokio::net::UdpSocket;

async fn next_matching<F: Fn(&Response) -> bool>(
    client: &GameClient,
    predicate: F,
) -> anyhow::Result<Response> {
    loop {
        let response = tokio::time::timeout(Duration::from_secs(2), client.recv_response()).await??;
        if predicate(&response) {
            return Ok(response);
        }
    }
}

#[tokio::test]
async fn key_exchange_returns_a_usable_public_key() -> anyhow::Result<()> {
    let dispatcher = common::spawn_server().await?;
    let cfg = common::client_config(&dispatcher, "unused", "unused");
    let client = GameClient::connect(&cfg).await?;

    client.obtain_public_key().await?;
    client.obtain_public_key().await?; // idempotent: asking twice is fine
    Ok(())
}

#[tokio::test]
async fn register_then_login_succeeds() -> anyhow::Result<()> {
    let dispatcher = common::spawn_server().await?;
    let name = common::unique_name("dave");
    let cfg = common::client_config(&dispatcher, &name, "hunter2");
    let mut client = GameClient::connect(&cfg).await?;

    client.register(&name, "hunter2").await?;
    client.login(&name, "hunter2").await?;

    let session = client.session().expect("login populates session");
    assert_eq!(session.name, name);
    assert_eq!(session.chunk_width, 400);
    assert_eq!(session.chunk_height, 400);
    Ok(())
}

#[tokio::test]
async fn duplicate_registration_is_rejected() -> anyhow::Result<()> {
    let dispatcher = common::spawn_server().await?;
    let name = common::unique_name("carol");
    let cfg = common::client_config(&dispatcher, &name, "secret");
    let client = GameClient::connect(&cfg).await?;

    client.register(&name, "secret").await?;
    let err = client.register(&name, "different").await.unwrap_err();
    assert!(err.to_string().contains("UsernameInUse"));
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_rejected_at_login() -> anyhow::Result<()> {
    let dispatcher = common::spawn_server().await?;
    let name = common::unique_name("erin");
    let cfg = common::client_config(&dispatcher, &name, "correct-password");
    let mut client = GameClient::connect(&cfg).await?;

    client.register(&name, "correct-password").await?;
    let err = client.login(&name, "wrong-password").await.unwrap_err();
    assert!(err.to_string().contains("InvalidInfo"));
    Ok(())
}

#[tokio::test]
async fn logout_frees_the_username_for_a_fresh_login() -> anyhow::Result<()> {
    let dispatcher = common::spawn_server().await?;
    let name = common::unique_name("frank");
    let cfg = common::client_config(&dispatcher, &name, "pw");
    let mut client = GameClient::connect(&cfg).await?;

    client.register(&name, "pw").await?;
    client.login(&name, "pw").await?;
    client.logout().await?;
    assert!(client.session().is_none());

    // Re-login must succeed: the registry actually dropped the session
    // rather than leaving a stale "already connected" entry behind.
    client.login(&name, "pw").await?;
    assert!(client.session().is_some());
    Ok(())
}

#[tokio::test]
async fn movement_broadcasts_a_position_update_to_every_client() -> anyhow::Result<()> {
    let dispatcher = common::spawn_server().await?;

    let name_a = common::unique_name("alice");
    let cfg_a = common::client_config(&dispatcher, &name_a, "pw-a");
    let mut client_a = GameClient::connect(&cfg_a).await?;
    client_a.register(&name_a, "pw-a").await?;
    client_a.login(&name_a, "pw-a").await?;
    let id_a = client_a.session().unwrap().client_id;

    let name_b = common::unique_name("bob");
    let cfg_b = common::client_config(&dispatcher, &name_b, "pw-b");
    let mut client_b = GameClient::connect(&cfg_b).await?;
    client_b.register(&name_b, "pw-b").await?;
    client_b.login(&name_b, "pw-b").await?;

    client_a.move_to(10.0, 0.0).await?;

    let update = next_matching(&client_b, |r| matches!(r, Response::PositionUpdate { id, .. } if *id == id_a)).await?;
    match update {
        Response::PositionUpdate { id, .. } => assert_eq!(id, id_a),
        other => panic!("expected position-update, got {other:?}"),
    }

    client_a.end_move().await?;
    Ok(())
}

#[tokio::test]
async fn unconfirmed_responses_are_retried() -> anyhow::Result<()> {
    let dispatcher = common::spawn_server().await?;
    let server_addr = dispatcher.local_addr();

    // A raw socket that never sends `confirm` back.
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(server_addr).await?;
    socket
        .send(serde_json::to_string(&serde_json::json!({"request": "obtain-public"}))?.as_bytes())
        .await?;

    let mut buf = [0u8; 2048];
    let n = tokio::time::timeout(Duration::from_secs(1), socket.recv(&mut buf)).await??;
    let first: serde_json::Value = serde_json::from_slice(&buf[..n])?;
    let first_id = first["packet-id"].clone();

    // Without a confirm, the relay's retry loop must resend the same
    // packet-id once the retry interval elapses.
    let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf)).await??;
    let second: serde_json::Value = serde_json::from_slice(&buf[..n])?;
    assert_eq!(second["packet-id"], first_id);

    Ok(())
}

#[tokio::test]
async fn malformed_json_yields_malformed_data_error() -> anyhow::Result<()> {
    let dispatcher = common::spawn_server().await?;
    let server_addr = dispatcher.local_addr();

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(server_addr).await?;
    socket.send(b"not json at all").await?;

    let mut buf = [0u8; 2048];
    let n = tokio::time::timeout(Duration::from_secs(1), socket.recv(&mut buf)).await??;
    let value: serde_json::Value = serde_json::from_slice(&buf[..n])?;
    assert_eq!(value["response"], "error");
    assert_eq!(value["type"], "malformed-data");

    let response: Response = serde_json::from_value(value)?;
    assert_eq!(response, Response::error(ErrorKind::MalformedData));
    Ok(())
}
