//! Shared factories for integration tests: a worker on an OS-picked port,
//! ready client sessions, and a raw wire connection for exact assertions.

use std::net::SocketAddr;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use trove::{Client, ClientConfig, Server, ServerConfig};

/// Start a worker on a free port with default settings.
pub async fn spawn_worker() -> SocketAddr {
    spawn_worker_with(|_| {}).await
}

/// Start a worker on a free port, with its config adjusted by `tweak`.
pub async fn spawn_worker_with(tweak: impl FnOnce(&mut ServerConfig)) -> SocketAddr {
    let mut config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    tweak(&mut config);
    let server = Server::bind(config).await.expect("bind the worker");
    let addr = server.local_addr().expect("a bound address");
    tokio::spawn(server.run());
    addr
}

/// A client session connected to `addr` and waited to readiness.
pub async fn ready_client(addr: SocketAddr) -> Client {
    let client = Client::connect(ClientConfig::for_port(addr.port()));
    client.wait_ready().await.expect("a ready session");
    client
}

/// A raw protocol connection, for tests that assert exact wire behavior.
pub struct RawConn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawConn {
    pub async fn open(addr: SocketAddr) -> RawConn {
        let stream = TcpStream::connect(addr)
            .await
            .expect("connect to the worker");
        let (read_half, write_half) = stream.into_split();
        RawConn {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
        }
    }

    pub async fn send(&mut self, request: Value) {
        let mut line = request.to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("write a request line");
    }

    pub async fn recv(&mut self) -> Value {
        let line = self
            .lines
            .next_line()
            .await
            .expect("read a line")
            .expect("an open connection");
        serde_json::from_str(&line).expect("a JSON line")
    }
}
