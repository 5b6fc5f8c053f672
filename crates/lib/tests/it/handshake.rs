//! The init secret gate, at both the wire and the session level.

use serde_json::json;

use trove::client::ClientError;
use trove::{Client, ClientConfig};

use crate::helpers::{RawConn, spawn_worker, spawn_worker_with};

#[tokio::test]
async fn commands_are_gated_until_init() {
    let addr = spawn_worker_with(|config| config.secret_key = Some("hunter2".into())).await;
    let mut conn = RawConn::open(addr).await;

    conn.send(json!({"id": 1, "action": "get", "key": "a"}))
        .await;
    assert!(
        conn.recv().await["error"]
            .as_str()
            .unwrap()
            .contains("init handshake")
    );

    conn.send(json!({"id": 2, "action": "init", "secretKey": "wrong"}))
        .await;
    assert!(
        conn.recv().await["error"]
            .as_str()
            .unwrap()
            .contains("invalid secret key")
    );

    conn.send(json!({"id": 3, "action": "init", "secretKey": "hunter2"}))
        .await;
    assert_eq!(
        conn.recv().await,
        json!({"type": "response", "id": 3, "action": "init"})
    );

    conn.send(json!({"id": 4, "action": "set", "key": "a", "value": 1}))
        .await;
    assert_eq!(conn.recv().await["value"], json!(1));
}

#[tokio::test]
async fn init_is_not_required_without_a_secret() {
    let addr = spawn_worker().await;
    let mut conn = RawConn::open(addr).await;

    conn.send(json!({"id": 1, "action": "set", "key": "a", "value": 1}))
        .await;
    assert_eq!(conn.recv().await["value"], json!(1));
}

#[tokio::test]
async fn client_sessions_handshake_transparently() {
    let addr = spawn_worker_with(|config| config.secret_key = Some("hunter2".into())).await;

    let client = Client::connect(ClientConfig {
        secret_key: Some("hunter2".into()),
        ..ClientConfig::for_port(addr.port())
    });
    client.wait_ready().await.expect("a ready session");
    assert_eq!(client.set("a", 1).await.unwrap(), json!(1));
}

#[tokio::test]
async fn a_rejected_handshake_fails_the_session_permanently() {
    let addr = spawn_worker_with(|config| config.secret_key = Some("hunter2".into())).await;

    let client = Client::connect(ClientConfig {
        secret_key: Some("wrong".into()),
        ..ClientConfig::for_port(addr.port())
    });
    let error = client.get("a").await.unwrap_err();
    assert!(matches!(error, ClientError::HandshakeRejected { .. }));

    // No retry with the same bad key: later requests fail the same way.
    let error = client.get("a").await.unwrap_err();
    assert!(matches!(error, ClientError::HandshakeRejected { .. }));
}
