//! The typed query AST.
//!
//! Scripts parse into this small tree and nothing else ever executes: there
//! is no host-language evaluation anywhere in the pipeline.

use serde_json::Value;

/// A parsed script: one parameter binding the store, a body of statements,
/// and an optional trailing expression whose value the script returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub param: String,
    pub body: Vec<Stmt>,
    pub tail: Option<Expr>,
}

/// One statement in a script body.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `let name = expr;`
    Let { name: String, value: Expr },
    /// `expr;`
    Expr(Expr),
}

/// One expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A primitive literal: null, bool, number, or string.
    Literal(Value),
    /// `[a, b, ...]` with element expressions.
    Array(Vec<Expr>),
    /// `{"k": v, ...}` with value expressions.
    Object(Vec<(String, Expr)>),
    /// A bound variable.
    Var(String),
    /// `target.method(args...)`, where `target` must name the store
    /// parameter.
    Call {
        target: String,
        method: StoreMethod,
        args: Vec<Expr>,
    },
}

/// The store operations callable from scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMethod {
    Get,
    Set,
    Add,
    Concat,
    Remove,
    RemoveAll,
    Pop,
    HasKey,
    GetRange,
    RemoveRange,
    Count,
}

impl StoreMethod {
    /// Resolve a method name from script source.
    pub fn parse(name: &str) -> Option<StoreMethod> {
        Some(match name {
            "get" => StoreMethod::Get,
            "set" => StoreMethod::Set,
            "add" => StoreMethod::Add,
            "concat" => StoreMethod::Concat,
            "remove" => StoreMethod::Remove,
            "remove_all" => StoreMethod::RemoveAll,
            "pop" => StoreMethod::Pop,
            "has_key" => StoreMethod::HasKey,
            "get_range" => StoreMethod::GetRange,
            "remove_range" => StoreMethod::RemoveRange,
            "count" => StoreMethod::Count,
            _ => return None,
        })
    }

    /// The canonical name, for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            StoreMethod::Get => "get",
            StoreMethod::Set => "set",
            StoreMethod::Add => "add",
            StoreMethod::Concat => "concat",
            StoreMethod::Remove => "remove",
            StoreMethod::RemoveAll => "remove_all",
            StoreMethod::Pop => "pop",
            StoreMethod::HasKey => "has_key",
            StoreMethod::GetRange => "get_range",
            StoreMethod::RemoveRange => "remove_range",
            StoreMethod::Count => "count",
        }
    }
}
