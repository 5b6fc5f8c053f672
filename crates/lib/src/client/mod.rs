//! Client session: a cloneable handle over a background connection task.
//!
//! A [`Client`] is a thin sender onto the session task, which owns the
//! socket and all request state. Requests made while the connection is down
//! are queued and replayed once it comes back; each request also carries its
//! own timeout, so a queued request still fails on schedule rather than
//! waiting forever. After the configured number of failed connection
//! attempts the session fails permanently and every request from then on is
//! answered with [`ClientError::ConnectFailed`].

mod errors;

pub use errors::ClientError;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::constants::{
    DEFAULT_HOST, DEFAULT_MAX_RETRIES, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_RETRY_INTERVAL, MAX_REQUEST_ID, WATCH_BUFFER,
};
use crate::protocol::{Request, ServerMessage, write_line};
use crate::query;

/// Settings for a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Secret presented in the `init` handshake. Required when the worker
    /// was started with one.
    pub secret_key: Option<String>,
    /// How long a request may wait for its response, queueing included.
    pub request_timeout: Duration,
    /// Delay between reconnection attempts.
    pub retry_interval: Duration,
    /// Reconnection attempts after the initial one before the session
    /// fails permanently.
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            secret_key: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at a specific local port.
    pub fn for_port(port: u16) -> Self {
        ClientConfig {
            port,
            ..ClientConfig::default()
        }
    }
}

/// Where the session currently stands. Observable via
/// [`Client::state`] and [`Client::wait_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    /// Closed cleanly by [`Client::end`].
    Ended,
    /// Gave up after exhausting connection attempts, or the handshake was
    /// rejected. Terminal.
    Failed,
}

/// Options for [`Client::run`] and [`Client::register_death_query`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Values folded into the script as `let` declarations before sending.
    pub data: Option<Map<String, Value>>,
    /// Path prefix scoping the script's view of the store.
    pub base_key: Option<String>,
    /// Fire-and-forget: no response, the local result is `None`.
    pub no_ack: bool,
}

/// A live watch on an event. Dropping it stops local delivery; pass it to
/// [`Client::unwatch`] to also release the server-side subscription.
#[derive(Debug)]
pub struct Subscription {
    event: String,
    token: u64,
    receiver: mpsc::Receiver<Value>,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// The next broadcast value, or `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

type ReplySender = oneshot::Sender<Result<Option<Value>, ClientError>>;

enum SessionCommand {
    Request {
        body: Request,
        reply: ReplySender,
    },
    RegisterWatch {
        event: String,
        sender: mpsc::Sender<Value>,
        reply: oneshot::Sender<u64>,
    },
    /// Drop one local watch token. Answers the event name when that was the
    /// last local watcher, meaning the server-side watch should go too.
    ReleaseWatch {
        token: u64,
        reply: oneshot::Sender<Option<String>>,
    },
    LocallyWatched {
        event: String,
        reply: oneshot::Sender<bool>,
    },
    ClearWatches,
    End {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
}

/// Handle to a session. Cheap to clone; all clones share one connection.
#[derive(Debug, Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    attempts: u32,
}

impl Client {
    /// Spawn the session task and return its handle. Connection happens in
    /// the background; use [`wait_ready`](Client::wait_ready) to block on
    /// it, or just issue requests and let them queue.
    pub fn connect(config: ClientConfig) -> Client {
        let attempts = config.max_retries + 1;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let session = Session::new(config, commands_rx, state_tx);
        tokio::spawn(session.run().instrument(info_span!("trove_client")));
        Client {
            commands: commands_tx,
            state: state_rx,
            attempts,
        }
    }

    /// The session's current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session is ready to serve requests immediately.
    pub async fn wait_ready(&self) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        loop {
            match *state.borrow_and_update() {
                SessionState::Ready => return Ok(()),
                SessionState::Ended => return Err(ClientError::SessionEnded),
                SessionState::Failed => {
                    return Err(ClientError::ConnectFailed {
                        attempts: self.attempts,
                    });
                }
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(ClientError::SessionEnded);
            }
        }
    }

    // Storage operations.

    /// Store `value` at `key`, returning the value as stored.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<Value, ClientError> {
        let mut body = Request::new("set");
        body.key = Some(Value::String(key.to_string()));
        body.value = Some(value.into());
        self.value_request(body).await
    }

    /// The value at `key`, or `Value::Null` when absent.
    pub async fn get(&self, key: &str) -> Result<Value, ClientError> {
        let mut body = Request::new("get");
        body.key = Some(Value::String(key.to_string()));
        self.value_request(body).await
    }

    /// The entire store, materialized from the root.
    pub async fn get_all(&self) -> Result<Value, ClientError> {
        self.request(Request::new("getAll"))
            .await
            .map(|value| value.unwrap_or(Value::Null))
    }

    /// Append `value` under the next free index at `key`.
    pub async fn add(&self, key: &str, value: impl Into<Value>) -> Result<Value, ClientError> {
        let mut body = Request::new("add");
        body.key = Some(Value::String(key.to_string()));
        body.value = Some(value.into());
        self.value_request(body).await
    }

    /// Merge `value` into the container at `key`.
    pub async fn concat(&self, key: &str, value: impl Into<Value>) -> Result<Value, ClientError> {
        let mut body = Request::new("concat");
        body.key = Some(Value::String(key.to_string()));
        body.value = Some(value.into());
        self.value_request(body).await
    }

    /// Remove the subtree at `key`.
    pub async fn remove(&self, key: &str) -> Result<(), ClientError> {
        let mut body = Request::new("remove");
        body.key = Some(Value::String(key.to_string()));
        self.request(body).await.map(drop)
    }

    /// Remove the subtree at `key` and return what was there.
    pub async fn take(&self, key: &str) -> Result<Value, ClientError> {
        let mut body = Request::new("remove");
        body.key = Some(Value::String(key.to_string()));
        body.get_value = Some(true);
        self.value_request(body).await
    }

    /// Clear the whole store.
    pub async fn remove_all(&self) -> Result<(), ClientError> {
        self.request(Request::new("removeAll")).await.map(drop)
    }

    /// Remove and return the last entry of the container at `key`.
    pub async fn pop(&self, key: &str) -> Result<Value, ClientError> {
        let mut body = Request::new("pop");
        body.key = Some(Value::String(key.to_string()));
        body.get_value = Some(true);
        self.value_request(body).await
    }

    /// Whether `key` resolves to anything.
    pub async fn has_key(&self, key: &str) -> Result<bool, ClientError> {
        let mut body = Request::new("hasKey");
        body.key = Some(Value::String(key.to_string()));
        let value = self.value_request(body).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// A slice of the container at `key` between two optional bounds, each
    /// an index number or a key name.
    pub async fn get_range(
        &self,
        key: &str,
        from: Option<Value>,
        to: Option<Value>,
    ) -> Result<Value, ClientError> {
        let mut body = Request::new("getRange");
        body.key = Some(Value::String(key.to_string()));
        body.from_index = from;
        body.to_index = to;
        self.value_request(body).await
    }

    /// Remove a slice of the container at `key`.
    pub async fn remove_range(
        &self,
        key: &str,
        from: Option<Value>,
        to: Option<Value>,
    ) -> Result<(), ClientError> {
        let mut body = Request::new("removeRange");
        body.key = Some(Value::String(key.to_string()));
        body.from_index = from;
        body.to_index = to;
        self.request(body).await.map(drop)
    }

    /// Remove a slice of the container at `key` and return it.
    pub async fn take_range(
        &self,
        key: &str,
        from: Option<Value>,
        to: Option<Value>,
    ) -> Result<Value, ClientError> {
        let mut body = Request::new("removeRange");
        body.key = Some(Value::String(key.to_string()));
        body.from_index = from;
        body.to_index = to;
        body.get_value = Some(true);
        self.value_request(body).await
    }

    /// Number of entries in the container at `key`.
    pub async fn count(&self, key: &str) -> Result<u64, ClientError> {
        let mut body = Request::new("count");
        body.key = Some(Value::String(key.to_string()));
        let value = self.value_request(body).await?;
        Ok(value.as_u64().unwrap_or(0))
    }

    // Expiry.

    /// Schedule every path in `keys` for eviction after `ttl`.
    pub async fn expire(&self, keys: &[&str], ttl: Duration) -> Result<(), ClientError> {
        let mut body = Request::new("expire");
        body.keys = Some(keys.iter().map(|k| k.to_string()).collect());
        body.value = Some(Value::from(ttl.as_secs_f64()));
        self.request(body).await.map(drop)
    }

    /// Cancel pending evictions for every path in `keys`.
    pub async fn unexpire(&self, keys: &[&str]) -> Result<(), ClientError> {
        let mut body = Request::new("unexpire");
        body.keys = Some(keys.iter().map(|k| k.to_string()).collect());
        self.request(body).await.map(drop)
    }

    /// Time left before `key` is evicted, or `None` when no expiry is set.
    pub async fn get_expiry(&self, key: &str) -> Result<Option<Duration>, ClientError> {
        let mut body = Request::new("getExpiry");
        body.key = Some(Value::String(key.to_string()));
        let value = self.value_request(body).await?;
        Ok(value.as_f64().map(Duration::from_secs_f64))
    }

    // Queries.

    /// Run a query script on the worker and return its result. With
    /// `no_ack` the script is fire-and-forget and the result is `None`.
    pub async fn run(
        &self,
        script: &str,
        options: RunOptions,
    ) -> Result<Option<Value>, ClientError> {
        let body = self.script_request("run", script, options)?;
        self.request(body).await
    }

    /// Register a script the worker runs when this session's connection
    /// terminates, cleanly or not.
    pub async fn register_death_query(
        &self,
        script: &str,
        options: RunOptions,
    ) -> Result<(), ClientError> {
        let body = self.script_request("registerDeathQuery", script, options)?;
        self.request(body).await.map(drop)
    }

    fn script_request(
        &self,
        action: &str,
        script: &str,
        options: RunOptions,
    ) -> Result<Request, ClientError> {
        // Data is folded in locally so the wire carries one script string.
        let source = match &options.data {
            Some(data) => query::prepare(script, data)?,
            None => script.to_string(),
        };
        let mut body = Request::new(action);
        body.value = Some(Value::String(source));
        body.base_key = options.base_key;
        if options.no_ack {
            body.no_ack = Some(true);
        }
        Ok(body)
    }

    // Events.

    /// Subscribe to an event and stream its broadcasts.
    pub async fn watch(&self, event: &str) -> Result<Subscription, ClientError> {
        let mut body = Request::new("watch");
        body.event = Some(Value::String(event.to_string()));
        self.request(body).await?;
        self.register_local(event).await
    }

    /// Subscribe to an event unless this session already holds a live local
    /// subscription on it. Returns `None` without a round trip when it does.
    pub async fn watch_once(&self, event: &str) -> Result<Option<Subscription>, ClientError> {
        if self.is_watching_locally(event).await? {
            return Ok(None);
        }
        let mut body = Request::new("watchOnce");
        body.event = Some(Value::String(event.to_string()));
        self.request(body).await?;
        self.register_local(event).await.map(Some)
    }

    /// Subscribe only when this session does not already watch `event`.
    /// Returns `None` when it already did.
    pub async fn watch_exclusive(&self, event: &str) -> Result<Option<Subscription>, ClientError> {
        let mut body = Request::new("watchExclusive");
        body.event = Some(Value::String(event.to_string()));
        let already = self.value_request(body).await?.as_bool().unwrap_or(false);
        if already {
            return Ok(None);
        }
        self.register_local(event).await.map(Some)
    }

    /// Release a subscription. The server-side watch is dropped once the
    /// last local subscription on that event is gone.
    pub async fn unwatch(&self, subscription: Subscription) -> Result<(), ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionCommand::ReleaseWatch {
            token: subscription.token,
            reply: reply_tx,
        })?;
        if let Some(event) = reply_rx.await.map_err(|_| ClientError::SessionEnded)? {
            let mut body = Request::new("unwatch");
            body.event = Some(Value::String(event));
            self.request(body).await?;
        }
        Ok(())
    }

    /// Drop every subscription this session holds, local and server-side.
    pub async fn unwatch_all(&self) -> Result<(), ClientError> {
        self.send(SessionCommand::ClearWatches)?;
        self.request(Request::new("unwatch")).await.map(drop)
    }

    /// Whether the worker has this session down as watching `event`.
    pub async fn is_watching(&self, event: &str) -> Result<bool, ClientError> {
        let mut body = Request::new("isWatching");
        body.event = Some(Value::String(event.to_string()));
        let value = self.value_request(body).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Whether any live local subscription on `event` exists.
    pub async fn is_watching_locally(&self, event: &str) -> Result<bool, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionCommand::LocallyWatched {
            event: event.to_string(),
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| ClientError::SessionEnded)
    }

    /// Push `value` to every watcher of `event`, this session included.
    pub async fn broadcast(&self, event: &str, value: impl Into<Value>) -> Result<(), ClientError> {
        let mut body = Request::new("broadcast");
        body.event = Some(Value::String(event.to_string()));
        body.value = Some(value.into());
        self.request(body).await.map(drop)
    }

    /// End the session cleanly: drop all watches, then wait for the worker
    /// to close the connection.
    pub async fn end(&self) -> Result<(), ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionCommand::End { reply: reply_tx })?;
        reply_rx.await.map_err(|_| ClientError::SessionEnded)?
    }

    async fn request(&self, body: Request) -> Result<Option<Value>, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionCommand::Request {
            body,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| ClientError::SessionEnded)?
    }

    async fn value_request(&self, body: Request) -> Result<Value, ClientError> {
        let action = body.action.clone();
        self.request(body)
            .await?
            .ok_or(ClientError::UnexpectedResponse { action })
    }

    async fn register_local(&self, event: &str) -> Result<Subscription, ClientError> {
        let (sender, receiver) = mpsc::channel(WATCH_BUFFER);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionCommand::RegisterWatch {
            event: event.to_string(),
            sender,
            reply: reply_tx,
        })?;
        let token = reply_rx.await.map_err(|_| ClientError::SessionEnded)?;
        Ok(Subscription {
            event: event.to_string(),
            token,
            receiver,
        })
    }

    fn send(&self, command: SessionCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::SessionEnded)
    }
}

/// A request waiting on its response, with its timeout timer running.
struct InFlight {
    action: String,
    reply: ReplySender,
    timer: AbortHandle,
}

/// How one connection's serve loop ended.
enum ConnOutcome {
    /// The socket dropped; retry.
    Lost,
    /// `end` completed or every handle is gone. Terminal.
    Ended,
    /// The worker refused the handshake. Terminal.
    Rejected(String),
}

struct Session {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: watch::Sender<SessionState>,
    next_id: u64,
    in_flight: HashMap<u64, InFlight>,
    /// Requests written once the connection is (back) up.
    pending: VecDeque<Request>,
    /// Local delivery fan-out, event name to token to channel.
    watches: HashMap<String, HashMap<u64, mpsc::Sender<Value>>>,
    tokens: HashMap<u64, String>,
    next_token: u64,
    expired_tx: mpsc::UnboundedSender<u64>,
    expired: mpsc::UnboundedReceiver<u64>,
}

impl Session {
    fn new(
        config: ClientConfig,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        state: watch::Sender<SessionState>,
    ) -> Session {
        let (expired_tx, expired) = mpsc::unbounded_channel();
        Session {
            config,
            commands,
            state,
            next_id: 0,
            in_flight: HashMap::new(),
            pending: VecDeque::new(),
            watches: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
            expired_tx,
            expired,
        }
    }

    async fn run(mut self) {
        let mut attempts_left = self.config.max_retries;
        loop {
            self.state.send_replace(SessionState::Connecting);
            let address = (self.config.host.clone(), self.config.port);
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    attempts_left = self.config.max_retries;
                    match self.serve_connection(stream).await {
                        ConnOutcome::Lost => {
                            debug!("connection lost, retrying");
                            self.fail_written_requests();
                        }
                        ConnOutcome::Ended => {
                            self.finish(SessionState::Ended, |_| ClientError::SessionEnded)
                                .await;
                            return;
                        }
                        ConnOutcome::Rejected(reason) => {
                            info!(%reason, "handshake rejected, session failed");
                            self.finish(SessionState::Failed, |_| {
                                ClientError::HandshakeRejected {
                                    reason: reason.clone(),
                                }
                            })
                            .await;
                            return;
                        }
                    }
                }
                Err(error) => debug!(%error, "connect failed"),
            }

            self.state.send_replace(SessionState::Disconnected);
            if attempts_left == 0 {
                let attempts = self.config.max_retries + 1;
                info!(attempts, "out of connection attempts, session failed");
                self.finish(SessionState::Failed, |_| ClientError::ConnectFailed {
                    attempts,
                })
                .await;
                return;
            }
            attempts_left -= 1;
            if self.wait_retry().await {
                self.finish(SessionState::Ended, |_| ClientError::SessionEnded)
                    .await;
                return;
            }
        }
    }

    /// Drive one live connection until it drops or the session ends.
    async fn serve_connection(&mut self, stream: TcpStream) -> ConnOutcome {
        let (read_half, write_half) = stream.into_split();
        let mut writer = write_half;
        let mut lines = BufReader::new(read_half).lines();

        if let Some(secret) = self.config.secret_key.clone() {
            match self.handshake(&mut writer, &mut lines, secret).await {
                Ok(()) => {}
                Err(outcome) => return outcome,
            }
        }

        // Watches survive reconnects locally, so tell the worker again.
        for event in self.watches.keys().cloned().collect::<Vec<_>>() {
            let mut body = Request::new("watch");
            body.event = Some(Value::String(event));
            body.no_ack = Some(true);
            if write_line(&mut writer, &body).await.is_err() {
                return ConnOutcome::Lost;
            }
        }

        while let Some(request) = self.pending.pop_front() {
            debug!(id = ?request.id, action = %request.action, "replaying queued request");
            if write_line(&mut writer, &request).await.is_err() {
                self.pending.push_front(request);
                return ConnOutcome::Lost;
            }
        }

        self.state.send_replace(SessionState::Ready);
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.decode_line(&line),
                    _ => return ConnOutcome::Lost,
                },
                Some(id) = self.expired.recv() => self.time_out(id),
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Request { body, reply }) => {
                        let request = self.track(body, reply);
                        if write_line(&mut writer, &request).await.is_err() {
                            self.pending.push_back(request);
                            return ConnOutcome::Lost;
                        }
                    }
                    Some(SessionCommand::RegisterWatch { event, sender, reply }) => {
                        let _ = reply.send(self.register_watch(event, sender));
                    }
                    Some(SessionCommand::ReleaseWatch { token, reply }) => {
                        let _ = reply.send(self.release_watch(token));
                    }
                    Some(SessionCommand::LocallyWatched { event, reply }) => {
                        let _ = reply.send(self.watches.contains_key(&event));
                    }
                    Some(SessionCommand::ClearWatches) => self.clear_watches(),
                    Some(SessionCommand::End { reply }) => {
                        return self.close(writer, lines, Some(reply)).await;
                    }
                    None => {
                        // Every handle is gone; close without a reply.
                        return self.close(writer, lines, None).await;
                    }
                },
            }
        }
    }

    /// Send `init` ahead of everything else and wait for its verdict.
    async fn handshake(
        &mut self,
        writer: &mut OwnedWriteHalf,
        lines: &mut Lines<BufReader<OwnedReadHalf>>,
        secret: String,
    ) -> Result<(), ConnOutcome> {
        self.state.send_replace(SessionState::Handshaking);
        let mut body = Request::new("init");
        let id = self.next_id();
        body.id = Some(id);
        body.secret_key = Some(secret);
        if write_line(writer, &body).await.is_err() {
            return Err(ConnOutcome::Lost);
        }
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<ServerMessage>(&line) {
                    Ok(ServerMessage::Response {
                        id: Some(got),
                        error,
                        ..
                    }) if got == id => {
                        return match error {
                            None => Ok(()),
                            Some(reason) => Err(ConnOutcome::Rejected(reason)),
                        };
                    }
                    Ok(message) => self.handle_message(message),
                    Err(error) => warn!(%error, "unparseable line during handshake"),
                },
                _ => return Err(ConnOutcome::Lost),
            }
        }
    }

    /// Graceful shutdown: release watches, half-close, and wait for the
    /// worker to hang up so its death queries have run.
    async fn close(
        &mut self,
        mut writer: OwnedWriteHalf,
        mut lines: Lines<BufReader<OwnedReadHalf>>,
        reply: Option<oneshot::Sender<Result<(), ClientError>>>,
    ) -> ConnOutcome {
        let mut body = Request::new("unwatch");
        body.no_ack = Some(true);
        let _ = write_line(&mut writer, &body).await;
        self.clear_watches();
        let _ = writer.shutdown().await;

        let drained = tokio::time::timeout(self.config.request_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                self.decode_line(&line);
            }
        })
        .await;
        let result = drained.map_err(|_| ClientError::DisconnectTimeout);
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        ConnOutcome::Ended
    }

    /// Sit out the retry delay, still answering commands. Returns true when
    /// the session was ended while waiting.
    async fn wait_retry(&mut self) -> bool {
        let delay = sleep(self.config.retry_interval);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return false,
                Some(id) = self.expired.recv() => self.time_out(id),
                command = self.commands.recv() => {
                    let Some(command) = command else { return true };
                    match command {
                        SessionCommand::Request { body, reply } => {
                            let request = self.track(body, reply);
                            self.pending.push_back(request);
                        }
                        SessionCommand::RegisterWatch { event, sender, reply } => {
                            let _ = reply.send(self.register_watch(event, sender));
                        }
                        SessionCommand::ReleaseWatch { token, reply } => {
                            let _ = reply.send(self.release_watch(token));
                        }
                        SessionCommand::LocallyWatched { event, reply } => {
                            let _ = reply.send(self.watches.contains_key(&event));
                        }
                        SessionCommand::ClearWatches => self.clear_watches(),
                        SessionCommand::End { reply } => {
                            let _ = reply.send(Ok(()));
                            return true;
                        }
                    }
                }
            }
        }
    }

    /// Enter a terminal state: fail everything outstanding, then keep
    /// answering commands with `make` until the last handle drops.
    async fn finish(mut self, state: SessionState, make: impl Fn(&str) -> ClientError) {
        self.state.send_replace(state);
        for (_, flight) in self.in_flight.drain() {
            flight.timer.abort();
            let _ = flight.reply.send(Err(make(&flight.action)));
        }
        self.pending.clear();
        self.clear_watches();

        while let Some(command) = self.commands.recv().await {
            match command {
                SessionCommand::Request { body, reply } => {
                    let _ = reply.send(Err(make(&body.action)));
                }
                SessionCommand::RegisterWatch { reply, .. } => drop(reply),
                SessionCommand::ReleaseWatch { reply, .. } => {
                    let _ = reply.send(None);
                }
                SessionCommand::LocallyWatched { reply, .. } => {
                    let _ = reply.send(false);
                }
                SessionCommand::ClearWatches => {}
                SessionCommand::End { reply } => {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    /// Assign an id and start the request's timeout clock. `noAck` requests
    /// are acknowledged locally right away.
    fn track(&mut self, mut body: Request, reply: ReplySender) -> Request {
        let id = self.next_id();
        body.id = Some(id);
        if body.no_ack == Some(true) {
            let _ = reply.send(Ok(None));
            return body;
        }
        let expired = self.expired_tx.clone();
        let timeout = self.config.request_timeout;
        let timer = tokio::spawn(async move {
            sleep(timeout).await;
            let _ = expired.send(id);
        })
        .abort_handle();
        self.in_flight.insert(
            id,
            InFlight {
                action: body.action.clone(),
                reply,
                timer,
            },
        );
        body
    }

    /// Fail every request that was written to a connection that just died.
    /// Requests still sitting in `pending` were never sent; they keep their
    /// reply channels and get replayed on the next connection.
    fn fail_written_requests(&mut self) {
        let written: Vec<u64> = self
            .in_flight
            .keys()
            .copied()
            .filter(|id| !self.pending.iter().any(|request| request.id == Some(*id)))
            .collect();
        for id in written {
            let Some(flight) = self.in_flight.remove(&id) else {
                continue;
            };
            flight.timer.abort();
            debug!(id, action = %flight.action, "request lost with the connection");
            let _ = flight.reply.send(Err(ClientError::Disconnected {
                action: flight.action,
            }));
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        if self.next_id > MAX_REQUEST_ID {
            self.next_id = 1;
        }
        self.next_id
    }

    fn time_out(&mut self, id: u64) {
        let Some(flight) = self.in_flight.remove(&id) else {
            return;
        };
        self.pending.retain(|request| request.id != Some(id));
        debug!(id, action = %flight.action, "request timed out");
        let _ = flight.reply.send(Err(ClientError::Timeout {
            action: flight.action,
        }));
    }

    fn decode_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<ServerMessage>(line) {
            Ok(message) => self.handle_message(message),
            Err(error) => warn!(%error, "unparseable line from the worker"),
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Response {
                id: Some(id),
                value,
                error,
                ..
            } => {
                let Some(flight) = self.in_flight.remove(&id) else {
                    debug!(id, "response for an unknown request");
                    return;
                };
                flight.timer.abort();
                let result = match error {
                    Some(message) => Err(ClientError::Command {
                        action: flight.action,
                        message,
                    }),
                    None => Ok(value),
                };
                let _ = flight.reply.send(result);
            }
            ServerMessage::Response { id: None, error, .. } => {
                warn!(?error, "the worker rejected a request line");
            }
            ServerMessage::Event { event, value } => {
                let Some(senders) = self.watches.get_mut(&event) else {
                    return;
                };
                senders.retain(|_, sender| match sender.try_send(value.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(%event, "watch buffer full, dropping an event");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
                if self.watches.get(&event).is_some_and(HashMap::is_empty) {
                    self.watches.remove(&event);
                }
            }
        }
    }

    fn register_watch(&mut self, event: String, sender: mpsc::Sender<Value>) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.tokens.insert(token, event.clone());
        self.watches.entry(event).or_default().insert(token, sender);
        token
    }

    fn release_watch(&mut self, token: u64) -> Option<String> {
        let event = self.tokens.remove(&token)?;
        let Some(senders) = self.watches.get_mut(&event) else {
            return Some(event);
        };
        senders.remove(&token);
        if senders.is_empty() {
            self.watches.remove(&event);
            return Some(event);
        }
        None
    }

    fn clear_watches(&mut self) {
        self.watches.clear();
        self.tokens.clear();
    }
}
