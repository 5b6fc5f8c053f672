//! Time-to-live scheduling, sweeps, and eviction announcements.

use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, timeout};

use trove::ServerConfig;

use crate::helpers::{ready_client, spawn_worker_with};

const WAIT: Duration = Duration::from_secs(5);

fn fast_sweep(config: &mut ServerConfig) {
    config.sweep_interval = Duration::from_millis(25);
}

#[tokio::test]
async fn expired_paths_are_evicted_and_announced() {
    let addr = spawn_worker_with(fast_sweep).await;
    let client = ready_client(addr).await;

    client.set("session.token", "abc").await.unwrap();
    let mut evictions = client.watch("session.token").await.unwrap();
    client
        .expire(&["session.token"], Duration::from_millis(50))
        .await
        .unwrap();

    // The sweep announces the evicted value on the path's event.
    let value = timeout(WAIT, evictions.recv()).await.unwrap().unwrap();
    assert_eq!(value, json!("abc"));
    assert!(!client.has_key("session.token").await.unwrap());
}

#[tokio::test]
async fn unexpire_cancels_a_pending_eviction() {
    let addr = spawn_worker_with(fast_sweep).await;
    let client = ready_client(addr).await;

    client.set("keep", 1).await.unwrap();
    client
        .expire(&["keep"], Duration::from_millis(50))
        .await
        .unwrap();
    client.unexpire(&["keep"]).await.unwrap();

    sleep(Duration::from_millis(300)).await;
    assert!(client.has_key("keep").await.unwrap());
    assert_eq!(client.get_expiry("keep").await.unwrap(), None);
}

#[tokio::test]
async fn get_expiry_reports_time_remaining() {
    let addr = spawn_worker_with(fast_sweep).await;
    let client = ready_client(addr).await;

    client.set("slow", 1).await.unwrap();
    client
        .expire(&["slow"], Duration::from_secs(30))
        .await
        .unwrap();

    let remaining = client.get_expiry("slow").await.unwrap().unwrap();
    assert!(remaining <= Duration::from_secs(30));
    assert!(remaining > Duration::from_secs(25));

    assert_eq!(client.get_expiry("never").await.unwrap(), None);
}

#[tokio::test]
async fn re_expiring_replaces_the_deadline() {
    let addr = spawn_worker_with(fast_sweep).await;
    let client = ready_client(addr).await;

    client.set("k", 1).await.unwrap();
    client
        .expire(&["k"], Duration::from_millis(50))
        .await
        .unwrap();
    client.expire(&["k"], Duration::from_secs(60)).await.unwrap();

    sleep(Duration::from_millis(300)).await;
    assert!(client.has_key("k").await.unwrap());
}

#[tokio::test]
async fn expiring_a_batch_covers_every_path() {
    let addr = spawn_worker_with(fast_sweep).await;
    let client = ready_client(addr).await;

    client.set("a", 1).await.unwrap();
    client.set("b", 2).await.unwrap();
    client
        .expire(&["a", "b"], Duration::from_millis(50))
        .await
        .unwrap();

    sleep(Duration::from_millis(300)).await;
    assert!(!client.has_key("a").await.unwrap());
    assert!(!client.has_key("b").await.unwrap());
}
