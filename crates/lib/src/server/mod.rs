//! The loopback worker: a TCP listener speaking newline-delimited JSON.
//!
//! All state lives in a single [`Dispatcher`] driven by one event loop, so
//! commands from every connection are applied in arrival order without any
//! locking. Each accepted socket gets two small tasks: a reader that decodes
//! request lines into events for the loop, and a writer that drains that
//! connection's outbound queue through the standard filter chain.

mod dispatch;
mod errors;
mod pubsub;

pub use errors::ServerError;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::constants::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_SWEEP_INTERVAL};
use crate::protocol::{FilterChain, Request, ServerMessage, write_filtered};
use dispatch::Dispatcher;

/// Identifier for one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub(crate) fn new() -> Self {
        ConnId(Uuid::new_v4())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Settings for a worker instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind. Anything other than a loopback address widens the
    /// trust boundary; the protocol itself has no transport security.
    pub host: String,
    /// Port to bind. Use 0 to let the OS pick one.
    pub port: u16,
    /// When set, connections must `init` with this key before any other
    /// action is accepted.
    pub secret_key: Option<String>,
    /// How often expired paths are evicted. This is the expiry accuracy.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            secret_key: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// What a connection's reader task feeds the event loop.
#[derive(Debug)]
enum ConnEvent {
    Request { conn: ConnId, request: Request },
    BadLine { conn: ConnId, detail: String },
    Closed { conn: ConnId },
}

/// A bound worker, ready to [`run`](Server::run).
pub struct Server {
    listener: TcpListener,
    dispatcher: Dispatcher,
    sweep_interval: Duration,
}

impl Server {
    /// Bind the listener. Fails immediately if the address is taken, so a
    /// caller can report a conflicting worker before serving anything.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ServerError::Bind { address, source })?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(Server {
            listener,
            dispatcher: Dispatcher::new(config.secret_key),
            sweep_interval: config.sweep_interval,
        })
    }

    /// The actual bound address, useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the task is dropped.
    pub async fn run(mut self) {
        async move {
            let (events_tx, mut events_rx) = mpsc::channel(100);
            let mut sweep = interval(self.sweep_interval);
            // Skip the immediate first tick.
            sweep.tick().await;

            loop {
                tokio::select! {
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer)) => self.accept(stream, peer, events_tx.clone()),
                        Err(error) => warn!(%error, "accept failed"),
                    },
                    Some(event) = events_rx.recv() => self.handle_event(event),
                    _ = sweep.tick() => self.dispatcher.sweep(Instant::now()),
                }
            }
        }
        .instrument(info_span!("trove_server"))
        .await
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr, events: mpsc::Sender<ConnEvent>) {
        let conn = ConnId::new();
        info!(%conn, %peer, "connection opened");
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.dispatcher.connection_opened(conn, outbound_tx);
        tokio::spawn(read_lines(conn, read_half, events).instrument(info_span!("reader", %conn)));
        tokio::spawn(
            write_lines(write_half, outbound_rx).instrument(info_span!("writer", %conn)),
        );
    }

    fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Request { conn, request } => self.dispatcher.handle_request(conn, request),
            ConnEvent::BadLine { conn, detail } => self.dispatcher.reject_line(conn, &detail),
            ConnEvent::Closed { conn } => {
                info!(%conn, "connection closed");
                self.dispatcher.connection_closed(conn);
            }
        }
    }
}

/// Decode request lines until the peer hangs up, then report the close.
async fn read_lines(conn: ConnId, read_half: OwnedReadHalf, events: mpsc::Sender<ConnEvent>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let event = match serde_json::from_str::<Request>(line) {
                    Ok(request) => ConnEvent::Request { conn, request },
                    Err(error) => ConnEvent::BadLine {
                        conn,
                        detail: error.to_string(),
                    },
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(error) => {
                debug!(%error, "read failed");
                break;
            }
        }
    }
    let _ = events.send(ConnEvent::Closed { conn }).await;
}

/// Drain one connection's outbound queue onto the socket.
async fn write_lines(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
) {
    let filters = FilterChain::standard();
    while let Some(message) = outbound.recv().await {
        if let Err(error) = write_filtered(&mut write_half, &message, &filters).await {
            debug!(%error, "write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
