//! Watches and broadcasts across sessions.

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use crate::helpers::{ready_client, spawn_worker};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn broadcasts_reach_every_watcher() {
    let addr = spawn_worker().await;
    let watcher = ready_client(addr).await;
    let other = ready_client(addr).await;
    let sender = ready_client(addr).await;

    let mut first = watcher.watch("jobs.done").await.unwrap();
    let mut second = other.watch("jobs.done").await.unwrap();

    sender
        .broadcast("jobs.done", json!({"id": 7}))
        .await
        .unwrap();

    let value = timeout(WAIT, first.recv()).await.unwrap().unwrap();
    assert_eq!(value, json!({"id": 7}));
    let value = timeout(WAIT, second.recv()).await.unwrap().unwrap();
    assert_eq!(value, json!({"id": 7}));
}

#[tokio::test]
async fn the_sender_hears_its_own_broadcast() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    let mut subscription = client.watch("ping").await.unwrap();
    client.broadcast("ping", "hello").await.unwrap();
    let value = timeout(WAIT, subscription.recv()).await.unwrap().unwrap();
    assert_eq!(value, json!("hello"));
}

#[tokio::test]
async fn unwatch_stops_delivery() {
    let addr = spawn_worker().await;
    let watcher = ready_client(addr).await;
    let sender = ready_client(addr).await;

    let subscription = watcher.watch("topic").await.unwrap();
    assert!(watcher.is_watching("topic").await.unwrap());

    watcher.unwatch(subscription).await.unwrap();
    assert!(!watcher.is_watching("topic").await.unwrap());

    // Nothing is listening now; the broadcast still succeeds.
    sender.broadcast("topic", 1).await.unwrap();
}

#[tokio::test]
async fn one_server_watch_backs_many_local_subscriptions() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    let first = client.watch("shared").await.unwrap();
    let second = client.watch("shared").await.unwrap();

    client.unwatch(first).await.unwrap();
    // One local subscription left, so the server-side watch stays.
    assert!(client.is_watching("shared").await.unwrap());
    assert!(client.is_watching_locally("shared").await.unwrap());

    client.unwatch(second).await.unwrap();
    assert!(!client.is_watching("shared").await.unwrap());
    assert!(!client.is_watching_locally("shared").await.unwrap());
}

#[tokio::test]
async fn watch_once_subscribes_only_when_not_already_watching() {
    let addr = spawn_worker().await;
    let watcher = ready_client(addr).await;
    let sender = ready_client(addr).await;

    let mut subscription = watcher.watch_once("tick").await.unwrap().unwrap();
    sender.broadcast("tick", 42).await.unwrap();
    let value = timeout(WAIT, subscription.recv()).await.unwrap().unwrap();
    assert_eq!(value, json!(42));

    // A second call sees the live subscription and acks without
    // registering another one.
    let again = timeout(WAIT, watcher.watch_once("tick")).await.unwrap();
    assert!(again.unwrap().is_none());
    assert!(watcher.is_watching("tick").await.unwrap());

    watcher.unwatch(subscription).await.unwrap();
    assert!(!watcher.is_watching("tick").await.unwrap());
}

#[tokio::test]
async fn watch_exclusive_is_per_session() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    let first = client.watch_exclusive("solo").await.unwrap();
    assert!(first.is_some());
    let second = client.watch_exclusive("solo").await.unwrap();
    assert!(second.is_none());

    // Another session is not affected by this one's claim.
    let other = ready_client(addr).await;
    assert!(other.watch_exclusive("solo").await.unwrap().is_some());
}

#[tokio::test]
async fn unwatch_all_clears_every_subscription() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    let _a = client.watch("a").await.unwrap();
    let _b = client.watch("b").await.unwrap();
    client.unwatch_all().await.unwrap();

    assert!(!client.is_watching("a").await.unwrap());
    assert!(!client.is_watching("b").await.unwrap());
    assert!(!client.is_watching_locally("a").await.unwrap());
}
