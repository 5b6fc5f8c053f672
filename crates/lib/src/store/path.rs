//! Dot-joined paths addressing nodes in the tree.
//!
//! A [`Path`] is an ordered sequence of [`Key`] segments. The conventional
//! text form joins segments with `.`: `"users.3.name"` addresses the `name`
//! entry of element `3` of the `users` container. Digits-only segments parse
//! as integer indices; everything else is a string name. The empty path
//! addresses the whole store.

use std::fmt;

/// One path segment, which is also one container entry key.
///
/// Containers are keyed by either a non-negative integer index or a string
/// name. The distinction drives materialization: a container holding only
/// contiguous `Index` keys from zero renders as a list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// A non-negative integer index.
    Index(usize),
    /// A string field name.
    Name(String),
}

impl Key {
    /// Parse one segment of a dot-joined path.
    ///
    /// A segment is an `Index` only when it is the canonical decimal form of
    /// a `usize`: `"7"` is `Index(7)` but `"007"` and `"18446744073709551616"`
    /// stay names, matching how they would render back out.
    pub fn parse(segment: &str) -> Key {
        if segment.as_bytes().iter().all(|b| b.is_ascii_digit())
            && let Ok(n) = segment.parse::<usize>()
            && n.to_string() == segment
        {
            return Key::Index(n);
        }
        Key::Name(segment.to_string())
    }

    /// Interpret a JSON value as a key, the way range bounds arrive on the
    /// wire: a non-negative integer number becomes an `Index`, a string goes
    /// through [`Key::parse`]. Anything else is not a key.
    pub fn from_value(value: &serde_json::Value) -> Option<Key> {
        match value {
            serde_json::Value::Number(n) => {
                let n = n.as_u64()?;
                usize::try_from(n).ok().map(Key::Index)
            }
            serde_json::Value::String(s) => Some(Key::parse(s)),
            _ => None,
        }
    }

    /// True for the `Index` variant.
    pub fn is_index(&self) -> bool {
        matches!(self, Key::Index(_))
    }

    /// The integer index, if this key is one.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Key::Index(n) => Some(*n),
            Key::Name(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Index(n) => write!(f, "{n}"),
            Key::Name(s) => f.write_str(s),
        }
    }
}

impl From<usize> for Key {
    fn from(n: usize) -> Self {
        Key::Index(n)
    }
}

/// An owned path: zero or more [`Key`] segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path {
    segments: Vec<Key>,
}

impl Path {
    /// The empty path, addressing the root container.
    pub fn root() -> Self {
        Path::default()
    }

    /// Parse a dot-joined path string.
    ///
    /// Empty segments (leading, trailing, or doubled dots) are skipped, so
    /// `"a..b."` parses the same as `"a.b"` and `""` parses as the root.
    pub fn parse(text: &str) -> Path {
        let segments = text
            .split('.')
            .filter(|s| !s.is_empty())
            .map(Key::parse)
            .collect();
        Path { segments }
    }

    /// Build a path from already-typed segments.
    pub fn from_segments(segments: Vec<Key>) -> Path {
        Path { segments }
    }

    /// True when this path addresses the root container.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True when there are no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The segments in order.
    pub fn segments(&self) -> &[Key] {
        &self.segments
    }

    /// All segments but the last, plus the last, when the path is non-empty.
    pub fn split_last(&self) -> Option<(&[Key], &Key)> {
        self.segments.split_last().map(|(last, init)| (init, last))
    }

    /// Append one segment.
    pub fn push(&mut self, key: Key) {
        self.segments.push(key);
    }

    /// This path extended with every segment of `other`.
    pub fn join(&self, other: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Path { segments }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(text: &str) -> Self {
        Path::parse(text)
    }
}

impl From<String> for Path {
    fn from(text: String) -> Self {
        Path::parse(&text)
    }
}
