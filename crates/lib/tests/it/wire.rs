//! Raw protocol tests: exact request and response lines against a worker.

use serde_json::json;

use crate::helpers::{RawConn, spawn_worker};

#[tokio::test]
async fn set_and_get_round_trip() {
    let addr = spawn_worker().await;
    let mut conn = RawConn::open(addr).await;

    conn.send(json!({"id": 1, "action": "set", "key": "user.name", "value": "ada"}))
        .await;
    assert_eq!(
        conn.recv().await,
        json!({"type": "response", "id": 1, "action": "set", "value": "ada"})
    );

    conn.send(json!({"id": 2, "action": "get", "key": "user"}))
        .await;
    assert_eq!(
        conn.recv().await,
        json!({"type": "response", "id": 2, "action": "get", "value": {"name": "ada"}})
    );

    // Missing paths read as null, never as an error.
    conn.send(json!({"id": 3, "action": "get", "key": "user.missing.deeper"}))
        .await;
    assert_eq!(
        conn.recv().await,
        json!({"type": "response", "id": 3, "action": "get", "value": null})
    );
}

#[tokio::test]
async fn index_keys_materialize_as_lists() {
    let addr = spawn_worker().await;
    let mut conn = RawConn::open(addr).await;

    conn.send(json!({"id": 1, "action": "add", "key": "queue", "value": "first"}))
        .await;
    conn.send(json!({"id": 2, "action": "add", "key": "queue", "value": "second"}))
        .await;
    conn.recv().await;
    conn.recv().await;

    conn.send(json!({"id": 3, "action": "get", "key": "queue"}))
        .await;
    assert_eq!(
        conn.recv().await,
        json!({"type": "response", "id": 3, "action": "get", "value": ["first", "second"]})
    );

    conn.send(json!({"id": 4, "action": "count", "key": "queue"}))
        .await;
    assert_eq!(
        conn.recv().await["value"],
        json!(2)
    );
}

#[tokio::test]
async fn value_macros_compile_against_the_store() {
    let addr = spawn_worker().await;
    let mut conn = RawConn::open(addr).await;

    conn.send(json!({"id": 1, "action": "set", "key": "name", "value": "ada"}))
        .await;
    conn.recv().await;

    // A lone $() substitutes the typed value; embedded it stringifies.
    conn.send(json!({"id": 2, "action": "set", "key": "greeting", "value": "hello $(name)"}))
        .await;
    assert_eq!(conn.recv().await["value"], json!("hello ada"));

    // %() evaluates a literal, so strings can carry typed values.
    conn.send(json!({"id": 3, "action": "set", "key": "pair", "value": "%([1, 2])"}))
        .await;
    assert_eq!(conn.recv().await["value"], json!([1, 2]));

    // A key can be resolved through the store too.
    conn.send(json!({"id": 4, "action": "set", "key": "pointer", "value": "greeting"}))
        .await;
    conn.recv().await;
    conn.send(json!({"id": 5, "action": "get", "key": "$(pointer)"}))
        .await;
    assert_eq!(conn.recv().await["value"], json!("hello ada"));
}

#[tokio::test]
async fn escaped_keys_keep_their_dots_end_to_end() {
    let addr = spawn_worker().await;
    let mut conn = RawConn::open(addr).await;

    // #() makes "192.168.0.1" one segment instead of a four-level path.
    conn.send(json!({"id": 1, "action": "set", "key": "hosts.#(192.168.0.1)", "value": "up"}))
        .await;
    conn.recv().await;

    // The placeholder never leaks: outbound filtering restores the dots.
    conn.send(json!({"id": 2, "action": "get", "key": "hosts"}))
        .await;
    assert_eq!(
        conn.recv().await["value"],
        json!({"192.168.0.1": "up"})
    );

    // The segment is atomic: its pieces are not addressable as a path.
    conn.send(json!({"id": 3, "action": "hasKey", "key": "hosts.192"}))
        .await;
    assert_eq!(conn.recv().await["value"], json!(false));
    conn.send(json!({"id": 4, "action": "hasKey", "key": "hosts.#(192.168.0.1)"}))
        .await;
    assert_eq!(conn.recv().await["value"], json!(true));
}

#[tokio::test]
async fn ranges_slice_by_index_or_name() {
    let addr = spawn_worker().await;
    let mut conn = RawConn::open(addr).await;

    conn.send(json!({"id": 1, "action": "set", "key": "l", "value": ["a", "b", "c", "d"]}))
        .await;
    conn.recv().await;

    // `toIndex` is exclusive.
    conn.send(json!({"id": 2, "action": "getRange", "key": "l", "fromIndex": 1, "toIndex": 3}))
        .await;
    assert_eq!(conn.recv().await["value"], json!(["b", "c"]));

    conn.send(json!({"id": 3, "action": "removeRange", "key": "l", "fromIndex": 1, "toIndex": 3, "getValue": true}))
        .await;
    assert_eq!(conn.recv().await["value"], json!(["b", "c"]));

    // Remaining entries reindex into a dense list.
    conn.send(json!({"id": 4, "action": "get", "key": "l"}))
        .await;
    assert_eq!(conn.recv().await["value"], json!(["a", "d"]));
}

#[tokio::test]
async fn get_value_flag_shapes_remove_responses() {
    let addr = spawn_worker().await;
    let mut conn = RawConn::open(addr).await;

    conn.send(json!({"id": 1, "action": "set", "key": "stack", "value": [1, 2]}))
        .await;
    conn.recv().await;

    conn.send(json!({"id": 2, "action": "pop", "key": "stack"}))
        .await;
    assert_eq!(
        conn.recv().await,
        json!({"type": "response", "id": 2, "action": "pop"})
    );

    conn.send(json!({"id": 3, "action": "pop", "key": "stack", "getValue": true}))
        .await;
    assert_eq!(conn.recv().await["value"], json!(1));
}

#[tokio::test]
async fn no_ack_requests_get_no_response() {
    let addr = spawn_worker().await;
    let mut conn = RawConn::open(addr).await;

    conn.send(json!({"id": 1, "action": "set", "key": "a", "value": 1, "noAck": true}))
        .await;
    conn.send(json!({"id": 2, "action": "get", "key": "a"}))
        .await;

    // The first line back answers the second request.
    let response = conn.recv().await;
    assert_eq!(response["id"], json!(2));
    assert_eq!(response["value"], json!(1));
}

#[tokio::test]
async fn bad_lines_and_bad_actions_answer_with_errors() {
    let addr = spawn_worker().await;
    let mut conn = RawConn::open(addr).await;

    conn.send(json!("not an object")).await;
    let response = conn.recv().await;
    assert_eq!(response["type"], json!("response"));
    assert_eq!(response["id"], json!(null));
    assert!(response["error"].as_str().unwrap().contains("could not parse"));

    conn.send(json!({"id": 1, "action": "explode"})).await;
    let response = conn.recv().await;
    assert!(response["error"].as_str().unwrap().contains("unknown action"));

    conn.send(json!({"id": 2, "action": "get", "key": 17})).await;
    let response = conn.recv().await;
    assert!(response["error"].as_str().unwrap().contains("not a string"));

    // The connection survives every one of those.
    conn.send(json!({"id": 3, "action": "hasKey", "key": "x"}))
        .await;
    assert_eq!(conn.recv().await["value"], json!(false));
}

#[tokio::test]
async fn scalar_at_root_is_rejected() {
    let addr = spawn_worker().await;
    let mut conn = RawConn::open(addr).await;

    conn.send(json!({"id": 1, "action": "set", "value": 42}))
        .await;
    let response = conn.recv().await;
    assert!(response["error"].is_string());

    conn.send(json!({"id": 2, "action": "set", "value": {"ok": true}}))
        .await;
    assert_eq!(conn.recv().await["value"], json!({"ok": true}));
}
