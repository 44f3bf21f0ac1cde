//! Smoke test: the dispatcher starts, answers a request, and shuts down
//! cleanly.

mod common;

use engine_client::GameClient;
use rsa::traits::PublicKeyParts;

#[tokio::test]
async fn server_answers_obtain_public_then_shuts_down() -> anyhow::Result<()> {
    let dispatcher = common::spawn_server().await?;
    let cfg = common::client_config(&dispatcher, "smoke", "irrelevant");

    let client = GameClient::connect(&cfg).await?;
    let key = client.obtain_public_key().await?;
    assert!(key.size() > 0);

    dispatcher.request_shutdown();
    Ok(())
}
