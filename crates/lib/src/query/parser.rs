//! Recursive-descent parsing of script text.
//!
//! The grammar is deliberately small. A script is `|param| { ... }`; the
//! body holds `let` bindings and expression statements separated by `;`,
//! with an optional un-terminated trailing expression as the result.
//! Expressions are JSON-style literals (arrays and objects may embed
//! sub-expressions), variables, and single-level method calls on the store
//! parameter. There are no operators, loops, or nested closures.

use serde_json::{Number, Value};

use super::ast::{Expr, Script, Stmt, StoreMethod};
use super::errors::QueryError;

/// Lexed token.
#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Pipe,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Colon,
    Dot,
    Eq,
    Let,
    True,
    False,
    Null,
    Ident(String),
    Str(String),
    Num(Number),
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Pipe => "'|'".into(),
            Tok::LBrace => "'{'".into(),
            Tok::RBrace => "'}'".into(),
            Tok::LParen => "'('".into(),
            Tok::RParen => "')'".into(),
            Tok::LBracket => "'['".into(),
            Tok::RBracket => "']'".into(),
            Tok::Comma => "','".into(),
            Tok::Semi => "';'".into(),
            Tok::Colon => "':'".into(),
            Tok::Dot => "'.'".into(),
            Tok::Eq => "'='".into(),
            Tok::Let => "'let'".into(),
            Tok::True => "'true'".into(),
            Tok::False => "'false'".into(),
            Tok::Null => "'null'".into(),
            Tok::Ident(name) => format!("identifier {name:?}"),
            Tok::Str(_) => "string literal".into(),
            Tok::Num(_) => "number literal".into(),
        }
    }
}

fn parse_err(detail: impl Into<String>) -> QueryError {
    QueryError::Parse {
        detail: detail.into(),
    }
}

/// True when `name` matches the identifier pattern data-mapping keys and
/// script variables must follow.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn lex(src: &str) -> Result<Vec<Tok>, QueryError> {
    let mut toks = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            c if c.is_ascii_whitespace() => i += 1,
            '|' => {
                toks.push(Tok::Pipe);
                i += 1;
            }
            '{' => {
                toks.push(Tok::LBrace);
                i += 1;
            }
            '}' => {
                toks.push(Tok::RBrace);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '[' => {
                toks.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                toks.push(Tok::RBracket);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            ';' => {
                toks.push(Tok::Semi);
                i += 1;
            }
            ':' => {
                toks.push(Tok::Colon);
                i += 1;
            }
            '.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            '=' => {
                toks.push(Tok::Eq);
                i += 1;
            }
            '"' => {
                let (tok, next) = lex_string(src, i)?;
                toks.push(tok);
                i = next;
            }
            c if c == '-' || c.is_ascii_digit() => {
                let (tok, next) = lex_number(src, i)?;
                toks.push(tok);
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                toks.push(match &src[start..i] {
                    "let" => Tok::Let,
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    ident => Tok::Ident(ident.to_string()),
                });
            }
            other => return Err(parse_err(format!("unexpected character {other:?}"))),
        }
    }
    Ok(toks)
}

/// Lex a double-quoted string starting at `start`, JSON escapes included.
fn lex_string(src: &str, start: usize) -> Result<(Tok, usize), QueryError> {
    let bytes = src.as_bytes();
    let mut i = start + 1;
    let mut escaped = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if !escaped => escaped = true,
            b'"' if !escaped => {
                let slice = &src[start..=i];
                let decoded: String = serde_json::from_str(slice)
                    .map_err(|e| parse_err(format!("bad string literal: {e}")))?;
                return Ok((Tok::Str(decoded), i + 1));
            }
            _ => escaped = false,
        }
        i += 1;
    }
    Err(parse_err("unterminated string literal"))
}

fn lex_number(src: &str, start: usize) -> Result<(Tok, usize), QueryError> {
    let bytes = src.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() && matches!(bytes[i], b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-') {
        i += 1;
    }
    let slice = &src[start..i];
    let number: Number = serde_json::from_str(slice)
        .map_err(|_| parse_err(format!("bad number literal {slice:?}")))?;
    Ok((Tok::Num(number), i))
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, context: &str) -> Result<(), QueryError> {
        if self.eat(tok) {
            return Ok(());
        }
        Err(match self.peek() {
            Some(found) => parse_err(format!(
                "expected {} {context}, found {}",
                tok.describe(),
                found.describe()
            )),
            None => parse_err(format!(
                "expected {} {context}, found end of script",
                tok.describe()
            )),
        })
    }

    fn ident(&mut self, context: &str) -> Result<String, QueryError> {
        match self.next() {
            Some(Tok::Ident(name)) => Ok(name),
            Some(found) => Err(parse_err(format!(
                "expected identifier {context}, found {}",
                found.describe()
            ))),
            None => Err(parse_err(format!(
                "expected identifier {context}, found end of script"
            ))),
        }
    }

    fn expr(&mut self) -> Result<Expr, QueryError> {
        match self.next() {
            Some(Tok::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Tok::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Tok::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Tok::Num(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::LBracket) => self.array(),
            Some(Tok::LBrace) => self.object(),
            Some(Tok::Ident(name)) => {
                if self.eat(&Tok::Dot) {
                    self.call(name)
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(found) => Err(parse_err(format!(
                "expected expression, found {}",
                found.describe()
            ))),
            None => Err(parse_err("expected expression, found end of script")),
        }
    }

    fn array(&mut self) -> Result<Expr, QueryError> {
        let mut items = Vec::new();
        if self.eat(&Tok::RBracket) {
            return Ok(Expr::Array(items));
        }
        loop {
            items.push(self.expr()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(&Tok::RBracket, "to close array")?;
            return Ok(Expr::Array(items));
        }
    }

    fn object(&mut self) -> Result<Expr, QueryError> {
        let mut fields = Vec::new();
        if self.eat(&Tok::RBrace) {
            return Ok(Expr::Object(fields));
        }
        loop {
            let key = match self.next() {
                Some(Tok::Str(s)) => s,
                Some(Tok::Ident(name)) => name,
                Some(found) => {
                    return Err(parse_err(format!(
                        "expected object key, found {}",
                        found.describe()
                    )));
                }
                None => return Err(parse_err("expected object key, found end of script")),
            };
            self.expect(&Tok::Colon, "after object key")?;
            fields.push((key, self.expr()?));
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(&Tok::RBrace, "to close object")?;
            return Ok(Expr::Object(fields));
        }
    }

    fn call(&mut self, target: String) -> Result<Expr, QueryError> {
        let name = self.ident("after '.'")?;
        let method =
            StoreMethod::parse(&name).ok_or(QueryError::UnknownMethod { name })?;
        self.expect(&Tok::LParen, "to open arguments")?;
        let mut args = Vec::new();
        if self.eat(&Tok::RParen) {
            return Ok(Expr::Call {
                target,
                method,
                args,
            });
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(&Tok::RParen, "to close arguments")?;
            return Ok(Expr::Call {
                target,
                method,
                args,
            });
        }
    }
}

/// Parse a full script.
pub fn parse_script(src: &str) -> Result<Script, QueryError> {
    let mut p = Parser {
        toks: lex(src)?,
        pos: 0,
    };
    p.expect(&Tok::Pipe, "to open the parameter list")?;
    let param = p.ident("as the store parameter")?;
    p.expect(&Tok::Pipe, "to close the parameter list")?;
    p.expect(&Tok::LBrace, "to open the script body")?;

    let mut body = Vec::new();
    let mut tail = None;
    while p.peek() != Some(&Tok::RBrace) {
        if p.eat(&Tok::Let) {
            let name = p.ident("after 'let'")?;
            p.expect(&Tok::Eq, "after the let name")?;
            let value = p.expr()?;
            p.expect(&Tok::Semi, "after the let binding")?;
            body.push(Stmt::Let { name, value });
        } else {
            let expr = p.expr()?;
            if p.eat(&Tok::Semi) {
                body.push(Stmt::Expr(expr));
            } else {
                tail = Some(expr);
                break;
            }
        }
    }
    p.expect(&Tok::RBrace, "to close the script body")?;
    if let Some(extra) = p.peek() {
        return Err(parse_err(format!(
            "unexpected {} after script body",
            extra.describe()
        )));
    }
    Ok(Script { param, body, tail })
}

/// Parse and fold a single literal expression, for `%(...)`.
pub fn parse_literal(src: &str) -> Result<Value, QueryError> {
    let mut p = Parser {
        toks: lex(src)?,
        pos: 0,
    };
    let expr = p.expr()?;
    if let Some(extra) = p.peek() {
        return Err(parse_err(format!(
            "unexpected {} after expression",
            extra.describe()
        )));
    }
    literal_value(&expr)
}

fn literal_value(expr: &Expr) -> Result<Value, QueryError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Array(items) => items
            .iter()
            .map(literal_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Object(fields) => {
            let mut map = serde_json::Map::new();
            for (key, value) in fields {
                map.insert(key.clone(), literal_value(value)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Var(_) | Expr::Call { .. } => Err(QueryError::NotLiteral),
    }
}
