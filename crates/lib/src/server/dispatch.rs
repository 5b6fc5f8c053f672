//! Table-driven command dispatch.
//!
//! The [`Dispatcher`] is the single serialization boundary: it owns the
//! store, the expiry tracker, the watch registry, and per-connection state,
//! and the command loop feeds it one decoded request at a time. Every
//! failure an action can produce is answered as an error string on the
//! request's id; nothing here ever tears down a connection or the worker.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::ConnId;
use super::pubsub::PubSubRegistry;
use crate::expiry::ExpiryTracker;
use crate::macros::Compiler;
use crate::protocol::{Request, ServerMessage};
use crate::query::{self, DeathQuery};
use crate::store::{Key, Path, Store};

/// Per-connection dispatcher state.
struct ConnState {
    outbound: mpsc::UnboundedSender<ServerMessage>,
    /// Whether this connection has passed the `init` handshake.
    authed: bool,
    death_queries: Vec<DeathQuery>,
}

/// Command-field values after macro compilation.
struct Compiled {
    path: Path,
    /// The compiled key's canonical text, for expiry bookkeeping.
    path_text: String,
    value: Value,
    event: Option<String>,
}

pub(super) struct Dispatcher {
    store: Store,
    expiry: ExpiryTracker,
    registry: PubSubRegistry,
    connections: HashMap<ConnId, ConnState>,
    secret: Option<String>,
}

impl Dispatcher {
    pub(super) fn new(secret: Option<String>) -> Self {
        Dispatcher {
            store: Store::new(),
            expiry: ExpiryTracker::new(),
            registry: PubSubRegistry::new(),
            connections: HashMap::new(),
            secret,
        }
    }

    /// Track a newly accepted connection and its outbound queue.
    pub(super) fn connection_opened(
        &mut self,
        conn: ConnId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) {
        self.connections.insert(
            conn,
            ConnState {
                outbound,
                authed: false,
                death_queries: Vec::new(),
            },
        );
    }

    /// Tear down a connection: run its death queries in registration order,
    /// then drop its subscriptions and outbound queue.
    pub(super) fn connection_closed(&mut self, conn: ConnId) {
        if let Some(state) = self.connections.remove(&conn) {
            for death_query in state.death_queries {
                match query::run(
                    &mut self.store,
                    &death_query.source,
                    death_query.base_key.as_ref(),
                ) {
                    Ok(_) => debug!(conn = %conn, "death query ran"),
                    Err(error) => warn!(conn = %conn, %error, "death query failed"),
                }
            }
        }
        self.registry.unwatch_all(conn);
    }

    /// Answer a line that never parsed into a request.
    pub(super) fn reject_line(&mut self, conn: ConnId, detail: &str) {
        warn!(conn = %conn, detail, "unparseable request line");
        self.send(
            conn,
            ServerMessage::error(None, "parse", format!("could not parse request: {detail}")),
        );
    }

    /// Process one decoded request and queue its response.
    pub(super) fn handle_request(&mut self, conn: ConnId, request: Request) {
        let id = request.id;
        let action = request.action.clone();
        let no_ack = request.no_ack.unwrap_or(false);
        debug!(conn = %conn, %action, ?id, "dispatching");

        let outcome = self.dispatch(conn, request);
        if no_ack {
            if let Err(error) = outcome {
                debug!(conn = %conn, %action, error, "noAck command failed");
            }
            return;
        }
        let message = match outcome {
            Ok(value) => ServerMessage::response(id, action, value),
            Err(error) => ServerMessage::error(id, action, error),
        };
        self.send(conn, message);
    }

    /// Evict every path whose deadline has passed, announcing each eviction
    /// to that path's watchers.
    pub(super) fn sweep(&mut self, now: Instant) {
        for path_text in self.expiry.take_due(now) {
            let removed = self.store.remove(&Path::parse(&path_text));
            debug!(path = %path_text, found = removed.is_some(), "expired");
            self.publish(&path_text, removed.unwrap_or(Value::Null));
        }
    }

    fn dispatch(&mut self, conn: ConnId, request: Request) -> Result<Option<Value>, String> {
        let action = request.action.as_str();

        if action == "init" {
            return self.init(conn, request.secret_key.as_deref());
        }
        if self.secret.is_some() && !self.is_authed(conn) {
            return Err("cannot process commands before a successful init handshake".into());
        }

        let fields = self.compile_fields(&request)?;
        let get_value = request.get_value.unwrap_or(false);

        match action {
            "set" => self
                .store
                .set(&fields.path, fields.value)
                .map(Some)
                .map_err(|e| e.to_string()),
            "get" => Ok(Some(
                self.store.get(&fields.path).unwrap_or(Value::Null),
            )),
            "getAll" => Ok(self.store.get(&Path::root())),
            "add" => Ok(Some(self.store.add(&fields.path, fields.value))),
            "concat" => Ok(Some(self.store.concat(&fields.path, fields.value))),
            "remove" => {
                let removed = self.store.remove(&fields.path);
                Ok(get_value.then(|| removed.unwrap_or(Value::Null)))
            }
            "removeAll" => {
                self.store.remove_all();
                Ok(None)
            }
            "pop" => {
                let popped = self.store.pop(&fields.path);
                Ok(get_value.then(|| popped.unwrap_or(Value::Null)))
            }
            "hasKey" => Ok(Some(Value::Bool(self.store.has_key(&fields.path)))),
            "getRange" => {
                let (from, to) = range_bounds(&request)?;
                Ok(Some(self.store.get_range(
                    &fields.path,
                    from.as_ref(),
                    to.as_ref(),
                )))
            }
            "removeRange" => {
                let (from, to) = range_bounds(&request)?;
                let removed = self
                    .store
                    .remove_range(&fields.path, from.as_ref(), to.as_ref());
                Ok(get_value.then_some(removed))
            }
            "count" => Ok(Some(Value::Number(self.store.count(&fields.path).into()))),
            "run" => {
                let source = self.prepared_script(&fields, &request)?;
                let base = request.base_key.as_deref().map(Path::parse);
                query::run(&mut self.store, &source, base.as_ref())
                    .map(Some)
                    .map_err(|e| format!("query failed: {e}"))
            }
            "registerDeathQuery" => {
                let source = self.prepared_script(&fields, &request)?;
                let base_key = request.base_key.as_deref().map(Path::parse);
                self.conn_mut(conn)?
                    .death_queries
                    .push(DeathQuery { source, base_key });
                Ok(None)
            }
            "expire" => {
                let keys = request
                    .keys
                    .as_ref()
                    .ok_or("the expire action requires a keys list")?;
                let seconds = request
                    .value
                    .as_ref()
                    .and_then(Value::as_f64)
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .ok_or("the expire action requires positive seconds in value")?;
                let now = Instant::now();
                let ttl = Duration::from_secs_f64(seconds);
                for key in keys {
                    self.expiry.expire(Path::parse(key).to_string(), ttl, now);
                }
                Ok(None)
            }
            "unexpire" => {
                let keys = request
                    .keys
                    .as_ref()
                    .ok_or("the unexpire action requires a keys list")?;
                for key in keys {
                    self.expiry.unexpire(&Path::parse(key).to_string());
                }
                Ok(None)
            }
            "getExpiry" => {
                let remaining = self.expiry.remaining(&fields.path_text, Instant::now());
                Ok(Some(match remaining {
                    Some(left) => serde_json::Number::from_f64(left.as_secs_f64())
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                    None => Value::Null,
                }))
            }
            "watch" | "watchOnce" => {
                let event = required_event(&fields, action)?;
                self.registry.watch(conn, &event);
                Ok(None)
            }
            "watchExclusive" => {
                let event = required_event(&fields, action)?;
                let already = self.registry.is_watching(conn, &event);
                if !already {
                    self.registry.watch(conn, &event);
                }
                Ok(Some(Value::Bool(already)))
            }
            "unwatch" => {
                match &fields.event {
                    Some(event) => self.registry.unwatch(conn, event),
                    None => self.registry.unwatch_all(conn),
                }
                Ok(None)
            }
            "isWatching" => {
                let event = required_event(&fields, action)?;
                Ok(Some(Value::Bool(self.registry.is_watching(conn, &event))))
            }
            "broadcast" => {
                let event = required_event(&fields, action)?;
                self.publish(&event, fields.value);
                Ok(None)
            }
            other => Err(format!("unknown action {other:?}")),
        }
    }

    fn init(&mut self, conn: ConnId, secret_key: Option<&str>) -> Result<Option<Value>, String> {
        match &self.secret {
            Some(secret) if secret_key == Some(secret.as_str()) => {
                self.conn_mut(conn)?.authed = true;
                Ok(None)
            }
            Some(_) => Err("an invalid secret key was supplied".into()),
            // No secret configured: the gate is open from the start.
            None => {
                self.conn_mut(conn)?.authed = true;
                Ok(None)
            }
        }
    }

    /// Run the macro compiler over the request's string fields.
    fn compile_fields(&self, request: &Request) -> Result<Compiled, String> {
        let compiler = Compiler::new(&self.store);

        let path_text = match &request.key {
            None => String::new(),
            Some(Value::String(text)) => match compiler.compile(text).map_err(stringify)? {
                Value::String(compiled) => compiled,
                other => {
                    return Err(format!(
                        "the specified key compiled to a non-string value: {other}"
                    ));
                }
            },
            Some(_) => return Err("the specified key is not a string".into()),
        };
        let path = Path::parse(&path_text);

        let value = match &request.value {
            Some(Value::String(text)) => compiler.compile(text).map_err(stringify)?,
            Some(other) => other.clone(),
            None => Value::Null,
        };

        let event = match &request.event {
            None => None,
            Some(Value::String(text)) => match compiler.compile(text).map_err(stringify)? {
                Value::String(compiled) => Some(compiled),
                other => {
                    return Err(format!(
                        "the specified event compiled to a non-string value: {other}"
                    ));
                }
            },
            Some(_) => return Err("the specified event is not a string".into()),
        };

        Ok(Compiled {
            path_text: path.to_string(),
            path,
            value,
            event,
        })
    }

    /// The script source for `run`/`registerDeathQuery`, with any data
    /// mapping folded in.
    fn prepared_script(&self, fields: &Compiled, request: &Request) -> Result<String, String> {
        let Value::String(source) = &fields.value else {
            return Err(format!(
                "the {} action requires a script string in value",
                request.action
            ));
        };
        match &request.data {
            Some(data) => query::prepare(source, data).map_err(stringify),
            None => query::prepare(source, &serde_json::Map::new()).map_err(stringify),
        }
    }

    /// Push an event to every watcher of `event`, sender included.
    fn publish(&mut self, event: &str, value: Value) {
        let watchers: Vec<ConnId> = self.registry.watchers(event).collect();
        debug!(%event, watchers = watchers.len(), "publishing");
        for watcher in watchers {
            self.send(
                watcher,
                ServerMessage::Event {
                    event: event.to_string(),
                    value: value.clone(),
                },
            );
        }
    }

    fn is_authed(&self, conn: ConnId) -> bool {
        self.connections.get(&conn).is_some_and(|c| c.authed)
    }

    fn conn_mut(&mut self, conn: ConnId) -> Result<&mut ConnState, String> {
        self.connections
            .get_mut(&conn)
            .ok_or_else(|| "connection is no longer tracked".into())
    }

    /// Queue a message on the connection's outbound channel. Never blocks;
    /// a closed queue just means the writer is already gone.
    fn send(&self, conn: ConnId, message: ServerMessage) {
        if let Some(state) = self.connections.get(&conn)
            && state.outbound.send(message).is_err()
        {
            debug!(conn = %conn, "dropping message for closed connection");
        }
    }
}

fn required_event(fields: &Compiled, action: &str) -> Result<String, String> {
    fields
        .event
        .clone()
        .ok_or_else(|| format!("the {action} action requires an event name"))
}

fn range_bounds(request: &Request) -> Result<(Option<Key>, Option<Key>), String> {
    let bound = |value: &Option<Value>, name: &str| -> Result<Option<Key>, String> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Key::from_value(value)
                .map(Some)
                .ok_or_else(|| format!("{name} must be an index or a key name")),
        }
    };
    Ok((
        bound(&request.from_index, "fromIndex")?,
        bound(&request.to_index, "toIndex")?,
    ))
}

fn stringify(error: impl std::fmt::Display) -> String {
    error.to_string()
}
