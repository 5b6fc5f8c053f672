//! Server-side query execution.
//!
//! A query is a small script shipped as text, shaped like a one-argument
//! closure: `|store| { ... }`. The body may bind values with `let`, call the
//! data operations on its store argument, and ends with an optional trailing
//! expression whose value becomes the response payload. Callers can pre-bind
//! names by sending a data mapping, which [`prepare`] renders into `let`
//! declarations at the top of the body before anything goes on the wire.
//!
//! Scripts never touch a host language: [`parse_script`] builds a typed AST
//! and [`run`] walks it against a [`Store`], optionally scoped under a base
//! path. The interpreter has no loops, no I/O, and no host access, which is
//! what makes shipping caller text to a trusted worker tolerable.

mod ast;
mod errors;
mod parser;

pub use ast::{Expr, Script, Stmt, StoreMethod};
pub use errors::QueryError;
pub use parser::{is_identifier, parse_script};

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::store::{Key, Path, Store};

/// A query kept to run when its registering connection dies.
///
/// Death queries carry the same prepared source a `run` would; the server
/// executes them in registration order on disconnect, logging failures
/// instead of answering anyone.
#[derive(Debug, Clone)]
pub struct DeathQuery {
    pub source: String,
    pub base_key: Option<Path>,
}

/// Evaluate a single literal expression, for the `%(...)` macro.
pub fn evaluate_literal(src: &str) -> Result<Value, QueryError> {
    parser::parse_literal(src)
}

/// Validate a script and fold a data mapping into its body.
///
/// Each data key must be an identifier; entries become `let key = <json>;`
/// declarations inserted right after the body's opening brace, so the script
/// runs with those names pre-bound. The result is checked to parse before it
/// is returned, which is what lets clients reject malformed scripts without
/// a round trip.
pub fn prepare(source: &str, data: &Map<String, Value>) -> Result<String, QueryError> {
    // Shape-check the bare script first so the error points at the caller's
    // text, not at the injected declarations.
    parse_script(source)?;
    if data.is_empty() {
        return Ok(source.to_string());
    }
    let mut declarations = String::new();
    for (name, value) in data {
        if !is_identifier(name) {
            return Err(QueryError::InvalidDataKey { name: name.clone() });
        }
        declarations.push_str(&format!(" let {name} = {value};"));
    }
    let brace = source
        .find('{')
        .expect("a parsed script has a body brace");
    let mut prepared = String::with_capacity(source.len() + declarations.len());
    prepared.push_str(&source[..=brace]);
    prepared.push_str(&declarations);
    prepared.push_str(&source[brace + 1..]);
    parse_script(&prepared)?;
    Ok(prepared)
}

/// Execute a script against `store`, scoped under `base_key` when given.
///
/// The script's parameter binds a view of the store rooted at the base path;
/// every path the script names is resolved under that prefix. The trailing
/// expression's value is returned, `null` when there is none.
pub fn run(store: &mut Store, source: &str, base_key: Option<&Path>) -> Result<Value, QueryError> {
    let script = parse_script(source)?;
    let mut env = Env {
        param: script.param.clone(),
        vars: HashMap::new(),
    };
    let mut handle = StoreHandle { store, base: base_key };
    for stmt in &script.body {
        match stmt {
            Stmt::Let { name, value } => {
                if *name == env.param {
                    return Err(QueryError::ReservedName { name: name.clone() });
                }
                let value = eval(value, &env, &mut handle)?;
                env.vars.insert(name.clone(), value);
            }
            Stmt::Expr(expr) => {
                eval(expr, &env, &mut handle)?;
            }
        }
    }
    match &script.tail {
        Some(expr) => eval(expr, &env, &mut handle),
        None => Ok(Value::Null),
    }
}

struct Env {
    param: String,
    vars: HashMap<String, Value>,
}

/// A store view with every path resolved under an optional prefix.
struct StoreHandle<'a> {
    store: &'a mut Store,
    base: Option<&'a Path>,
}

impl StoreHandle<'_> {
    fn resolve(&self, text: &str) -> Path {
        let path = Path::parse(text);
        match self.base {
            Some(base) => base.join(&path),
            None => path,
        }
    }
}

fn eval(expr: &Expr, env: &Env, handle: &mut StoreHandle<'_>) -> Result<Value, QueryError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, env, handle))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Object(fields) => {
            let mut map = Map::new();
            for (key, value) in fields {
                map.insert(key.clone(), eval(value, env, handle)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Var(name) => {
            if *name == env.param {
                return Err(QueryError::StoreNotAValue { name: name.clone() });
            }
            env.vars
                .get(name)
                .cloned()
                .ok_or_else(|| QueryError::UnknownVariable { name: name.clone() })
        }
        Expr::Call {
            target,
            method,
            args,
        } => {
            if *target != env.param {
                return Err(if env.vars.contains_key(target) {
                    QueryError::NotTheStore {
                        name: target.clone(),
                    }
                } else {
                    QueryError::UnknownVariable {
                        name: target.clone(),
                    }
                });
            }
            let args = args
                .iter()
                .map(|arg| eval(arg, env, handle))
                .collect::<Result<Vec<_>, _>>()?;
            call(*method, args, handle)
        }
    }
}

fn call(
    method: StoreMethod,
    args: Vec<Value>,
    handle: &mut StoreHandle<'_>,
) -> Result<Value, QueryError> {
    let name = method.name();
    match method {
        StoreMethod::Get => {
            let [path] = take_args(name, "1", args)?;
            let path = path_arg(name, 0, &path, handle)?;
            Ok(handle.store.get(&path).unwrap_or(Value::Null))
        }
        StoreMethod::Set => {
            let [path, value] = take_args(name, "2", args)?;
            let path = path_arg(name, 0, &path, handle)?;
            Ok(handle.store.set(&path, value)?)
        }
        StoreMethod::Add => {
            let [path, value] = take_args(name, "2", args)?;
            let path = path_arg(name, 0, &path, handle)?;
            Ok(handle.store.add(&path, value))
        }
        StoreMethod::Concat => {
            let [path, value] = take_args(name, "2", args)?;
            let path = path_arg(name, 0, &path, handle)?;
            Ok(handle.store.concat(&path, value))
        }
        StoreMethod::Remove => {
            let [path] = take_args(name, "1", args)?;
            let path = path_arg(name, 0, &path, handle)?;
            Ok(handle.store.remove(&path).unwrap_or(Value::Null))
        }
        StoreMethod::RemoveAll => {
            let [] = take_args::<0>(name, "0", args)?;
            match handle.base {
                // Scoped scripts only clear their own sub-tree.
                Some(base) => {
                    handle.store.remove(base);
                }
                None => handle.store.remove_all(),
            }
            Ok(Value::Null)
        }
        StoreMethod::Pop => {
            let [path] = take_args(name, "1", args)?;
            let path = path_arg(name, 0, &path, handle)?;
            Ok(handle.store.pop(&path).unwrap_or(Value::Null))
        }
        StoreMethod::HasKey => {
            let [path] = take_args(name, "1", args)?;
            let path = path_arg(name, 0, &path, handle)?;
            Ok(Value::Bool(handle.store.has_key(&path)))
        }
        StoreMethod::GetRange | StoreMethod::RemoveRange => {
            if args.len() < 2 || args.len() > 3 {
                return Err(QueryError::Arity {
                    method: name,
                    expected: "2 or 3",
                    got: args.len(),
                });
            }
            let path = path_arg(name, 0, &args[0], handle)?;
            let from = key_arg(name, 1, &args[1])?;
            let to = match args.get(2) {
                Some(value) => Some(key_arg(name, 2, value)?),
                None => None,
            };
            Ok(match method {
                StoreMethod::GetRange => {
                    handle.store.get_range(&path, Some(&from), to.as_ref())
                }
                _ => handle.store.remove_range(&path, Some(&from), to.as_ref()),
            })
        }
        StoreMethod::Count => {
            let [path] = take_args(name, "1", args)?;
            let path = path_arg(name, 0, &path, handle)?;
            Ok(Value::Number(handle.store.count(&path).into()))
        }
    }
}

fn take_args<const N: usize>(
    method: &'static str,
    expected: &'static str,
    args: Vec<Value>,
) -> Result<[Value; N], QueryError> {
    let got = args.len();
    args.try_into().map_err(|_| QueryError::Arity {
        method,
        expected,
        got,
    })
}

fn path_arg(
    method: &'static str,
    index: usize,
    value: &Value,
    handle: &StoreHandle<'_>,
) -> Result<Path, QueryError> {
    match value {
        Value::String(text) => Ok(handle.resolve(text)),
        _ => Err(QueryError::BadArgument {
            method,
            index,
            expected: "a path string",
        }),
    }
}

fn key_arg(method: &'static str, index: usize, value: &Value) -> Result<Key, QueryError> {
    Key::from_value(value).ok_or(QueryError::BadArgument {
        method,
        index,
        expected: "an index or key name",
    })
}
