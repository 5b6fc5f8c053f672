//! Lexing for macro text.
//!
//! The tokenizer turns raw command text into a flat token stream, deciding
//! escapedness as it goes: a paren or sigil preceded by an odd-length run of
//! backslashes is literal text, not structure. Backslashes themselves stay
//! in the text they escape; nothing is unescaped here. The compiler never
//! looks at individual characters again.

/// One lexed piece of macro text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A run of plain text, escape runs included verbatim.
    Text(String),
    /// A sigil immediately followed by `(`, both unescaped.
    SigilOpen(char),
    /// An unescaped `(` that does not follow a sigil.
    Open,
    /// An unescaped `)`.
    Close,
}

/// Lex `input`, treating each of `sigils` as a potential invocation start.
pub fn tokenize(input: &str, sigils: &[char]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut escape_run = 0usize;
    let mut chars = input.chars().peekable();

    let flush = |tokens: &mut Vec<Token>, text: &mut String| {
        if !text.is_empty() {
            tokens.push(Token::Text(std::mem::take(text)));
        }
    };

    while let Some(c) = chars.next() {
        if c == '\\' {
            text.push(c);
            escape_run += 1;
            continue;
        }
        let escaped = escape_run % 2 == 1;
        escape_run = 0;
        match c {
            '(' if !escaped => {
                flush(&mut tokens, &mut text);
                tokens.push(Token::Open);
            }
            ')' if !escaped => {
                flush(&mut tokens, &mut text);
                tokens.push(Token::Close);
            }
            c if !escaped && sigils.contains(&c) && chars.peek() == Some(&'(') => {
                chars.next();
                flush(&mut tokens, &mut text);
                tokens.push(Token::SigilOpen(c));
            }
            other => text.push(other),
        }
    }
    flush(&mut tokens, &mut text);
    tokens
}
