//! Client session lifecycle: queueing, timeouts, reconnects, and `end`.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::{Instant, sleep};

use trove::client::ClientError;
use trove::{Client, ClientConfig, RunOptions, Server, ServerConfig, SessionState};

use crate::helpers::{ready_client, spawn_worker};

#[tokio::test]
async fn requests_issued_before_readiness_are_queued() {
    let addr = spawn_worker().await;
    let client = Client::connect(ClientConfig::for_port(addr.port()));

    // No wait_ready: the request rides along once the connection is up.
    assert_eq!(client.set("early", 1).await.unwrap(), json!(1));
    assert_eq!(client.state(), SessionState::Ready);
}

#[tokio::test]
async fn the_typed_surface_covers_the_store() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    assert_eq!(client.get_all().await.unwrap(), json!({}));

    client.set("cfg", json!({"a": 1})).await.unwrap();
    client.concat("cfg", json!({"b": 2})).await.unwrap();
    assert_eq!(client.get("cfg").await.unwrap(), json!({"a": 1, "b": 2}));

    client.add("log", "one").await.unwrap();
    client.add("log", "two").await.unwrap();
    client.add("log", "three").await.unwrap();
    assert_eq!(client.count("log").await.unwrap(), 3);
    assert_eq!(client.pop("log").await.unwrap(), json!("three"));
    assert_eq!(
        client
            .get_range("log", Some(json!(0)), Some(json!(1)))
            .await
            .unwrap(),
        json!(["one"])
    );
    assert_eq!(
        client
            .take_range("log", Some(json!(1)), None)
            .await
            .unwrap(),
        json!(["two"])
    );

    assert_eq!(client.take("cfg.a").await.unwrap(), json!(1));
    assert!(!client.has_key("cfg.a").await.unwrap());

    client.remove("cfg").await.unwrap();
    assert!(!client.has_key("cfg").await.unwrap());

    client.remove_all().await.unwrap();
    assert_eq!(client.get_all().await.unwrap(), json!({}));
}

#[tokio::test]
async fn requests_time_out_without_a_response() {
    // A listener that accepts and then says nothing.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let client = Client::connect(ClientConfig {
        request_timeout: Duration::from_millis(100),
        ..ClientConfig::for_port(addr.port())
    });
    let error = client.get("a").await.unwrap_err();
    assert!(error.is_timeout());
}

#[tokio::test]
async fn written_requests_fail_fast_when_the_connection_drops() {
    // A listener that reads one request and hangs up without answering.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(socket).lines();
        let _ = lines.next_line().await;
    });

    let client = Client::connect(ClientConfig {
        request_timeout: Duration::from_secs(30),
        retry_interval: Duration::from_millis(20),
        max_retries: 0,
        ..ClientConfig::for_port(addr.port())
    });
    client.wait_ready().await.unwrap();

    // The request dies with the connection, long before its timer fires.
    let started = Instant::now();
    let error = client.get("a").await.unwrap_err();
    assert!(error.is_disconnected(), "unexpected error: {error}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn responses_settle_their_own_requests_out_of_order() {
    // A worker stand-in that collects three requests and answers newest
    // first, so replies arrive in the reverse of request order.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut received = Vec::new();
        while received.len() < 3 {
            let line = lines.next_line().await.unwrap().unwrap();
            received.push(serde_json::from_str::<serde_json::Value>(&line).unwrap());
        }
        for request in received.iter().rev() {
            let value = match request["action"].as_str() {
                Some("run") => json!(99),
                _ => request["key"].clone(),
            };
            let response = json!({
                "type": "response",
                "id": request["id"],
                "action": request["action"],
                "value": value,
            });
            let line = format!("{response}\n");
            write_half.write_all(line.as_bytes()).await.unwrap();
        }
    });

    let client = Client::connect(ClientConfig::for_port(addr.port()));
    client.wait_ready().await.unwrap();

    let (slow, a, b) = tokio::join!(
        client.run("|m| { m.count(\"jobs\") }", RunOptions::default()),
        client.get("a"),
        client.get("b"),
    );
    assert_eq!(slow.unwrap(), Some(json!(99)));
    assert_eq!(a.unwrap(), json!("a"));
    assert_eq!(b.unwrap(), json!("b"));
}

#[tokio::test]
async fn sessions_fail_after_exhausting_reconnects() {
    // Grab a free port and release it so nothing is listening there.
    let free_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = Client::connect(ClientConfig {
        retry_interval: Duration::from_millis(20),
        max_retries: 1,
        ..ClientConfig::for_port(free_port)
    });

    let error = client.get("a").await.unwrap_err();
    assert!(matches!(error, ClientError::ConnectFailed { attempts: 2 }));

    assert!(client.wait_ready().await.unwrap_err().is_connect_failed());
    assert_eq!(client.state(), SessionState::Failed);
}

#[tokio::test]
async fn sessions_reconnect_and_replay_queued_requests() {
    let server = Server::bind(ServerConfig {
        port: 0,
        ..ServerConfig::default()
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let worker = tokio::spawn(server.run());

    let client = Client::connect(ClientConfig {
        retry_interval: Duration::from_millis(50),
        max_retries: 200,
        request_timeout: Duration::from_secs(30),
        ..ClientConfig::for_port(addr.port())
    });
    client.wait_ready().await.unwrap();
    client.set("before", 1).await.unwrap();

    // Take the worker down mid-session.
    worker.abort();
    sleep(Duration::from_millis(100)).await;

    // This request has nowhere to go yet; it queues.
    let queued = {
        let client = client.clone();
        tokio::spawn(async move { client.set("after", 2).await })
    };
    sleep(Duration::from_millis(100)).await;

    // Bring a fresh worker up on the same port.
    let server = Server::bind(ServerConfig {
        port: addr.port(),
        ..ServerConfig::default()
    })
    .await
    .unwrap();
    tokio::spawn(server.run());

    assert_eq!(queued.await.unwrap().unwrap(), json!(2));
    assert_eq!(client.get("after").await.unwrap(), json!(2));
}

#[tokio::test]
async fn watches_are_reestablished_after_a_reconnect() {
    let server = Server::bind(ServerConfig {
        port: 0,
        ..ServerConfig::default()
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let worker = tokio::spawn(server.run());

    let client = Client::connect(ClientConfig {
        retry_interval: Duration::from_millis(50),
        max_retries: 200,
        ..ClientConfig::for_port(addr.port())
    });
    client.wait_ready().await.unwrap();
    let mut subscription = client.watch("topic").await.unwrap();

    worker.abort();
    sleep(Duration::from_millis(100)).await;
    let server = Server::bind(ServerConfig {
        port: addr.port(),
        ..ServerConfig::default()
    })
    .await
    .unwrap();
    tokio::spawn(server.run());

    // The new worker knows nothing about us; wait until the session has
    // re-registered its watch there.
    loop {
        // Requests racing the dead connection may still time out.
        if let Ok(true) = client.is_watching("topic").await {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    let sender = ready_client(addr).await;
    sender.broadcast("topic", 9).await.unwrap();
    let value = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!(9));
}

#[tokio::test]
async fn ending_a_session_is_clean_and_final() {
    let addr = spawn_worker().await;
    let client = ready_client(addr).await;

    client.set("a", 1).await.unwrap();
    client.end().await.unwrap();
    assert_eq!(client.state(), SessionState::Ended);

    let error = client.get("a").await.unwrap_err();
    assert!(error.is_session_ended());

    // A second end is harmless.
    client.end().await.unwrap();
}
