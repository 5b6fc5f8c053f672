//! Query scripts over the wire: batching, data folding, scoping, and
//! death queries.

use std::time::Duration;

use serde_json::{Map, json};
use tokio::time::sleep;

use trove::RunOptions;
use trove::client::ClientError;

use crate::helpers::{RawConn, ready_client, spawn_worker};

#[tokio::test]
async fn scripts_batch_store_operations_in_one_round_trip() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    client.set("counters.a", 1).await.unwrap();
    let result = client
        .run(
            r#"|m| {
                let current = m.get("counters.a");
                m.set("counters.b", current);
                m.count("counters")
            }"#,
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result, Some(json!(2)));
    assert_eq!(client.get("counters.b").await.unwrap(), json!(1));
}

#[tokio::test]
async fn data_is_folded_into_the_script() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    let mut data = Map::new();
    data.insert("incoming".into(), json!({"x": 1, "y": [2, 3]}));
    client
        .run(
            r#"|m| { m.set("payload", incoming) }"#,
            RunOptions {
                data: Some(data),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        client.get("payload").await.unwrap(),
        json!({"x": 1, "y": [2, 3]})
    );
}

#[tokio::test]
async fn a_base_key_scopes_the_script() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    client.set("tenants.blue.kept", true).await.unwrap();
    client
        .run(
            r#"|m| { m.set("answer", 42) }"#,
            RunOptions {
                base_key: Some("tenants.green".into()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(client.get("tenants.green.answer").await.unwrap(), json!(42));
    assert_eq!(client.get("tenants.blue.kept").await.unwrap(), json!(true));
}

#[tokio::test]
async fn no_ack_scripts_are_fire_and_forget() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    let result = client
        .run(
            r#"|m| { m.set("fired", true) }"#,
            RunOptions {
                no_ack: true,
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, None);

    // Requests are served in order on one connection, so the next read
    // observes the script's effect.
    assert_eq!(client.get("fired").await.unwrap(), json!(true));
}

#[tokio::test]
async fn script_failures_come_back_as_command_errors() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    let error = client
        .run("|m| { nonsense }", RunOptions::default())
        .await
        .unwrap_err();
    assert!(error.is_command());
    assert!(error.to_string().contains("query failed"));
}

#[tokio::test]
async fn bad_data_keys_fail_before_anything_is_sent() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    let mut data = Map::new();
    data.insert("not an identifier".into(), json!(1));
    let error = client
        .run(
            r#"|m| { m.get("x") }"#,
            RunOptions {
                data: Some(data),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Query(_)));
}

#[tokio::test]
async fn death_queries_run_when_a_session_ends() {
    let addr = spawn_worker().await;
    let observer = ready_client(addr).await;
    let client = ready_client(addr).await;

    observer.set("monitor.alive", true).await.unwrap();
    client
        .register_death_query(
            r#"|m| { m.set("monitor.alive", false) }"#,
            RunOptions::default(),
        )
        .await
        .unwrap();

    // `end` waits for the worker to close the connection, which happens
    // after the death queries have run.
    client.end().await.unwrap();
    assert_eq!(observer.get("monitor.alive").await.unwrap(), json!(false));
}

#[tokio::test]
async fn death_queries_run_on_abrupt_disconnects_too() {
    let addr = spawn_worker().await;
    let observer = ready_client(addr).await;

    let mut conn = RawConn::open(addr).await;
    conn.send(json!({
        "id": 1,
        "action": "registerDeathQuery",
        "value": r#"|m| { m.set("cleanup.ran", true) }"#
    }))
    .await;
    conn.recv().await;
    drop(conn);

    for _ in 0..50 {
        if observer.get("cleanup.ran").await.unwrap() == json!(true) {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("the death query never ran");
}

#[tokio::test]
async fn death_queries_honor_their_base_key() {
    let addr = spawn_worker().await;
    let observer = ready_client(addr).await;
    let client = ready_client(addr).await;

    client
        .register_death_query(
            r#"|m| { m.set("gone", true) }"#,
            RunOptions {
                base_key: Some("sessions.one".into()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();
    client.end().await.unwrap();

    assert_eq!(
        observer.get("sessions.one.gone").await.unwrap(),
        json!(true)
    );
}
