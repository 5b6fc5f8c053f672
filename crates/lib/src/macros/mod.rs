//! Macro preprocessing for command string fields.
//!
//! Before the dispatcher acts on a command, its string fields pass through
//! the [`Compiler`]. A macro invocation is a one-character sigil glued to a
//! parenthesized argument; arguments may nest further invocations, which
//! compile innermost-first:
//!
//! - `$(path)` substitutes the store value at `path`,
//! - `%(expr)` evaluates a literal expression,
//! - `#(text)` escapes `text` so parens, quotes, and dots survive later
//!   parsing; dots become [`DOT_PLACEHOLDER`] and are restored by
//!   [`restore_literal`] on the way back out.
//!
//! When an entire field is a single invocation the field becomes the
//! produced value, whatever its JSON type; an invocation embedded in
//! surrounding text is stringified and spliced in. The compiler works on
//! the tokenizer's stream with an explicit frame stack, so nesting depth
//! and escapedness are structural rather than index arithmetic.

mod errors;
mod tokenizer;

pub use errors::MacroError;
pub use tokenizer::{Token, tokenize};

use serde_json::Value;

use crate::constants::DOT_PLACEHOLDER;
use crate::query;
use crate::store::{Path, Store};

/// The recognized sigil characters.
pub const SIGILS: [char; 3] = ['$', '%', '#'];

/// Compiles command text against a store snapshot.
///
/// Only `$(...)` touches the store, and only to read.
pub struct Compiler<'a> {
    store: &'a Store,
}

/// One compiled piece of a field: raw text or an already-produced value.
#[derive(Debug)]
enum Fragment {
    Text(String),
    Value(Value),
}

/// What an open paren on the stack belongs to.
#[derive(Debug)]
enum FrameKind {
    /// The whole field.
    Root,
    /// A plain paren group inside an invocation argument.
    Group,
    /// A sigil invocation argument.
    Sigil(char),
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    fragments: Vec<Fragment>,
}

impl Frame {
    fn new(kind: FrameKind) -> Self {
        Frame {
            kind,
            fragments: Vec::new(),
        }
    }

    fn push_text(&mut self, text: impl Into<String>) {
        // Merge adjacent text runs so fragment counting stays meaningful.
        if let Some(Fragment::Text(last)) = self.fragments.last_mut() {
            last.push_str(&text.into());
        } else {
            self.fragments.push(Fragment::Text(text.into()));
        }
    }
}

impl<'a> Compiler<'a> {
    pub fn new(store: &'a Store) -> Self {
        Compiler { store }
    }

    /// Compile one command field.
    ///
    /// Returns the field's compiled value: a string unless the whole field
    /// was a single substitution or evaluation producing something else.
    pub fn compile(&self, input: &str) -> Result<Value, MacroError> {
        let mut root = Frame::new(FrameKind::Root);
        let mut stack: Vec<Frame> = Vec::new();
        for token in tokenize(input, &SIGILS) {
            match token {
                Token::Text(text) => top(&mut root, &mut stack).push_text(text),
                Token::SigilOpen(sigil) => stack.push(Frame::new(FrameKind::Sigil(sigil))),
                Token::Open => {
                    // At the root, parens are ordinary text; inside an
                    // invocation they group and must balance.
                    if stack.is_empty() {
                        root.push_text("(");
                    } else {
                        stack.push(Frame::new(FrameKind::Group));
                    }
                }
                Token::Close => match stack.pop() {
                    None => root.push_text(")"),
                    Some(frame) => match frame.kind {
                        FrameKind::Group => {
                            let inner = render_text(&frame.fragments);
                            top(&mut root, &mut stack).push_text(format!("({inner})"));
                        }
                        FrameKind::Sigil(sigil) => {
                            let value = self.apply(sigil, &frame.fragments)?;
                            top(&mut root, &mut stack)
                                .fragments
                                .push(Fragment::Value(value));
                        }
                        FrameKind::Root => {}
                    },
                },
            }
        }
        if !stack.is_empty() {
            let sigil = stack
                .iter()
                .rev()
                .find_map(|frame| match frame.kind {
                    FrameKind::Sigil(s) => Some(s),
                    _ => None,
                })
                .unwrap_or('(');
            return Err(MacroError::Unterminated { sigil });
        }
        Ok(render(root.fragments))
    }

    fn apply(&self, sigil: char, argument: &[Fragment]) -> Result<Value, MacroError> {
        let text = render_text(argument);
        match sigil {
            '$' => {
                let path = Path::parse(&text);
                Ok(self.store.get(&path).unwrap_or(Value::Null))
            }
            '%' => Ok(query::evaluate_literal(&text)?),
            '#' => Ok(Value::String(escape_literal(&text))),
            other => unreachable!("tokenizer only emits known sigils, got {other}"),
        }
    }
}

fn top<'s>(root: &'s mut Frame, stack: &'s mut Vec<Frame>) -> &'s mut Frame {
    stack.last_mut().unwrap_or(root)
}

/// Collapse fragments to the field value: one lone value passes through
/// typed, anything else becomes joined text.
fn render(mut fragments: Vec<Fragment>) -> Value {
    match fragments.len() {
        0 => Value::String(String::new()),
        1 => match fragments.remove(0) {
            Fragment::Text(text) => Value::String(text),
            Fragment::Value(value) => value,
        },
        _ => Value::String(render_text(&fragments)),
    }
}

/// Join fragments as text, stringifying values the way they splice into
/// surrounding text: bare strings stay unquoted, everything else renders as
/// JSON.
fn render_text(fragments: &[Fragment]) -> String {
    let mut out = String::new();
    for fragment in fragments {
        match fragment {
            Fragment::Text(text) => out.push_str(text),
            Fragment::Value(Value::String(s)) => out.push_str(s),
            Fragment::Value(other) => out.push_str(&other.to_string()),
        }
    }
    out
}

/// The `#(...)` transform: backslash-escape parens and quotes, hide dots
/// behind [`DOT_PLACEHOLDER`].
pub fn escape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\'' | '"' => {
                out.push('\\');
                out.push(c);
            }
            '.' => out.push(DOT_PLACEHOLDER),
            other => out.push(other),
        }
    }
    out
}

/// Undo [`escape_literal`] for text leaving the process: placeholders become
/// dots again and one escaping backslash is dropped before each paren or
/// quote. Applied by the server's outbound filter.
pub fn restore_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            DOT_PLACEHOLDER => out.push('.'),
            '\\' if matches!(chars.peek(), Some('(' | ')' | '\'' | '"')) => {}
            other => out.push(other),
        }
    }
    out
}
