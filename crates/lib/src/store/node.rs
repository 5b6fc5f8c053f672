//! Tree nodes: scalar leaves and ordered containers.
//!
//! A [`Node`] is either a [`Scalar`] (one JSON primitive) or a [`Container`]
//! (an insertion-ordered collection keyed by [`Key`]). Containers have no
//! inherent list-or-map identity while stored; the shape is decided at read
//! time by [`Container::shape`], a pure function, and [`materialize`] renders
//! the tagged result to JSON.
//!
//! [`materialize`]: Node::materialize

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::{Map, Number, Value};

use super::path::Key;

/// A leaf value: one JSON primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
}

impl Scalar {
    /// Render to a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Number(n) => Value::Number(n.clone()),
            Scalar::Text(s) => Value::String(s.clone()),
        }
    }
}

/// The read-time identity of a container, decided by [`Container::shape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Renders as a JSON array.
    List,
    /// Renders as a JSON object.
    Map,
}

/// An insertion-ordered collection of child nodes keyed by [`Key`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    entries: IndexMap<Key, Node>,
}

impl Container {
    /// An empty container.
    pub fn new() -> Self {
        Container::default()
    }

    /// Number of immediate children.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no children.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The child at `key`, if present.
    pub fn child(&self, key: &Key) -> Option<&Node> {
        self.entries.get(key)
    }

    /// Mutable access to the child at `key`.
    pub fn child_mut(&mut self, key: &Key) -> Option<&mut Node> {
        self.entries.get_mut(key)
    }

    /// Insert or replace the child at `key`.
    pub fn insert(&mut self, key: Key, node: Node) {
        self.entries.insert(key, node);
    }

    /// The child at `key`, inserting `default()` when absent.
    pub fn child_or_insert_with(
        &mut self,
        key: Key,
        default: impl FnOnce() -> Node,
    ) -> &mut Node {
        self.entries.entry(key).or_insert_with(default)
    }

    /// The container at `key`, creating an empty one when the entry is
    /// absent and replacing a scalar in the way. This is the
    /// auto-vivification step: created intermediates start as empty
    /// containers, which read as maps until integer keys fill them.
    pub fn container_child_mut(&mut self, key: Key) -> &mut Container {
        let child = self.entries.entry(key).or_insert_with(Node::empty_container);
        if !child.is_container() {
            *child = Node::empty_container();
        }
        match child {
            Node::Container(c) => c,
            _ => unreachable!("just assigned a container"),
        }
    }

    /// Remove the child at `key`, preserving the order of the rest.
    ///
    /// When this container is list-shaped and `key` is an index, the
    /// remaining indices are renumbered so the list stays contiguous.
    /// Map-shaped containers only lose the one entry.
    pub fn remove(&mut self, key: &Key) -> Option<Node> {
        let reindex = self.shape() == Shape::List && key.is_index();
        let removed = self.entries.shift_remove(key)?;
        if reindex {
            self.renumber();
        }
        Some(removed)
    }

    /// Remove the child at `key` without renumbering anything.
    pub(super) fn remove_raw(&mut self, key: &Key) -> Option<Node> {
        self.entries.shift_remove(key)
    }

    /// Renumber `Index` keys to `0..n` by ascending index, keeping names and
    /// insertion order untouched.
    pub(super) fn renumber(&mut self) {
        let mut old_indices: Vec<usize> =
            self.entries.keys().filter_map(Key::as_index).collect();
        old_indices.sort_unstable();
        let remap: HashMap<usize, usize> = old_indices
            .into_iter()
            .enumerate()
            .map(|(new, old)| (old, new))
            .collect();
        let entries = std::mem::take(&mut self.entries);
        self.entries = entries
            .into_iter()
            .map(|(key, node)| match key {
                Key::Index(i) => (Key::Index(remap[&i]), node),
                name => (name, node),
            })
            .collect();
    }

    /// Iterate children in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Node)> {
        self.entries.iter()
    }

    /// The keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    /// The highest `Index` key present, if any.
    pub fn highest_index(&self) -> Option<usize> {
        self.entries.keys().filter_map(Key::as_index).max()
    }

    /// The index an appended element lands at: one past the highest `Index`
    /// key, or `0` for a container with none.
    pub fn next_index(&self) -> usize {
        self.highest_index().map_or(0, |n| n + 1)
    }

    /// Decide the read-time shape without mutating anything.
    ///
    /// A container is a [`Shape::List`] only when it is non-empty and its
    /// keys are exactly the integers `0..len`, in any insertion order. The
    /// empty container, any string key, and any gap all make it a map.
    pub fn shape(&self) -> Shape {
        let len = self.entries.len();
        if len == 0 {
            return Shape::Map;
        }
        let contiguous = self
            .entries
            .keys()
            .all(|key| matches!(key, Key::Index(i) if *i < len));
        if contiguous { Shape::List } else { Shape::Map }
    }

    /// The keys in materialized order: index order for a list, insertion
    /// order for a map.
    pub fn ordered_keys(&self) -> Vec<Key> {
        match self.shape() {
            Shape::List => (0..self.entries.len()).map(Key::Index).collect(),
            Shape::Map => self.entries.keys().cloned().collect(),
        }
    }

    /// Render to JSON using the shape decided by [`Container::shape`].
    pub fn materialize(&self) -> Value {
        match self.shape() {
            Shape::List => {
                let mut slots = vec![Value::Null; self.entries.len()];
                for (key, node) in &self.entries {
                    if let Key::Index(i) = key {
                        slots[*i] = node.materialize();
                    }
                }
                Value::Array(slots)
            }
            Shape::Map => {
                let mut map = Map::new();
                for (key, node) in &self.entries {
                    map.insert(key.to_string(), node.materialize());
                }
                Value::Object(map)
            }
        }
    }
}

/// One node of the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Scalar(Scalar),
    Container(Container),
}

impl Node {
    /// An empty container node.
    pub fn empty_container() -> Node {
        Node::Container(Container::new())
    }

    /// True for container nodes.
    pub fn is_container(&self) -> bool {
        matches!(self, Node::Container(_))
    }

    /// Borrow the container, if this node is one.
    pub fn as_container(&self) -> Option<&Container> {
        match self {
            Node::Container(c) => Some(c),
            Node::Scalar(_) => None,
        }
    }

    /// Mutably borrow the container, if this node is one.
    pub fn as_container_mut(&mut self) -> Option<&mut Container> {
        match self {
            Node::Container(c) => Some(c),
            Node::Scalar(_) => None,
        }
    }

    /// Decompose a JSON value into a node.
    ///
    /// Arrays become containers keyed `0..len`; objects become containers
    /// with each field name parsed as a [`Key`] (so `{"0": x, "1": y}`
    /// round-trips back to a list); primitives become scalars.
    pub fn from_value(value: Value) -> Node {
        match value {
            Value::Null => Node::Scalar(Scalar::Null),
            Value::Bool(b) => Node::Scalar(Scalar::Bool(b)),
            Value::Number(n) => Node::Scalar(Scalar::Number(n)),
            Value::String(s) => Node::Scalar(Scalar::Text(s)),
            Value::Array(items) => {
                let mut container = Container::new();
                for (i, item) in items.into_iter().enumerate() {
                    container.insert(Key::Index(i), Node::from_value(item));
                }
                Node::Container(container)
            }
            Value::Object(fields) => {
                let mut container = Container::new();
                for (name, field) in fields {
                    container.insert(Key::parse(&name), Node::from_value(field));
                }
                Node::Container(container)
            }
        }
    }

    /// Render to JSON.
    pub fn materialize(&self) -> Value {
        match self {
            Node::Scalar(s) => s.to_value(),
            Node::Container(c) => c.materialize(),
        }
    }
}
