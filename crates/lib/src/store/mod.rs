//! The hierarchical key-path store.
//!
//! A [`Store`] owns one tree of [`Node`]s rooted at an always-present
//! container and exposes every data operation the command dispatcher and the
//! query engine need. Reads materialize JSON on the way out and never mutate
//! the tree; writes auto-create the containers they need. The store has no
//! internal locking: the server's command loop owns it and applies one
//! operation at a time.
//!
//! Paths address nodes as described in [`path`]; the empty path addresses
//! the root, so `get(&Path::root())` is the whole store.

mod errors;
mod node;
mod path;

pub use errors::StoreError;
pub use node::{Container, Node, Scalar, Shape};
pub use path::{Key, Path};

use serde_json::{Map, Value};

/// The in-memory tree plus its operations.
#[derive(Debug, Default)]
pub struct Store {
    root: Container,
}

impl Store {
    /// An empty store.
    pub fn new() -> Self {
        Store::default()
    }

    /// The materialized value at `path`, or `None` when nothing is there.
    pub fn get(&self, path: &Path) -> Option<Value> {
        if path.is_root() {
            return Some(self.root.materialize());
        }
        self.node_at(path).map(Node::materialize)
    }

    /// Write `value` at `path`, replacing whatever was there.
    ///
    /// Intermediate containers are created as needed; a scalar sitting in
    /// the middle of the path is replaced by a fresh container. Writing the
    /// root requires an array- or object-shaped value so the root stays a
    /// container. Returns the stored value, materialized.
    pub fn set(&mut self, path: &Path, value: Value) -> Result<Value, StoreError> {
        let node = Node::from_value(value);
        let Some((parents, last)) = path.split_last() else {
            return match node {
                Node::Container(container) => {
                    self.root = container;
                    Ok(self.root.materialize())
                }
                Node::Scalar(_) => Err(StoreError::ScalarAtRoot),
            };
        };
        let rendered = node.materialize();
        let parent = self.descend_creating(parents);
        parent.insert(last.clone(), node);
        Ok(rendered)
    }

    /// Append `value` to the container at `path`.
    ///
    /// The element lands at the container's next append index. An absent
    /// path gets a fresh container; a scalar at `path` is first wrapped into
    /// a container holding the old value at index 0, so the new value lands
    /// at index 1. Returns the stored value, materialized.
    pub fn add(&mut self, path: &Path, value: Value) -> Value {
        let node = Node::from_value(value);
        let rendered = node.materialize();
        let container = self.mount_container(path);
        let index = container.next_index();
        container.insert(Key::Index(index), node);
        rendered
    }

    /// Merge `value` into the container at `path` and return the resulting
    /// node, materialized.
    ///
    /// A list-shaped target appends each element of `value` in order (a
    /// scalar appends as one element). A map-shaped target, which includes
    /// fresh and empty containers, merges `value`'s entries key by key, so
    /// concatenating an array onto an empty path still builds a list.
    pub fn concat(&mut self, path: &Path, value: Value) -> Value {
        let incoming = Node::from_value(value);
        let container = self.mount_container(path);
        match (container.shape(), incoming) {
            (Shape::List, Node::Container(items)) => {
                for key in items.ordered_keys() {
                    if let Some(node) = items.child(&key) {
                        let index = container.next_index();
                        container.insert(Key::Index(index), node.clone());
                    }
                }
            }
            (_, Node::Scalar(scalar)) => {
                let index = container.next_index();
                container.insert(Key::Index(index), Node::Scalar(scalar));
            }
            (Shape::Map, Node::Container(fields)) => {
                for (key, node) in fields.iter() {
                    container.insert(key.clone(), node.clone());
                }
            }
        }
        container.materialize()
    }

    /// Detach the node at `path` and return its materialized value.
    ///
    /// Removing an index from a list-shaped container renumbers the rest so
    /// the list stays contiguous. Removing the root clears the store and
    /// returns the old contents.
    pub fn remove(&mut self, path: &Path) -> Option<Value> {
        let Some((parents, last)) = path.split_last() else {
            let old = self.root.materialize();
            self.root = Container::new();
            return Some(old);
        };
        let parent = self.descend_existing_mut(parents)?;
        parent.remove(last).map(|node| node.materialize())
    }

    /// Remove and return the element at the highest index of the container
    /// at `path`.
    ///
    /// A container with no integer keys, or a scalar at `path`, is removed
    /// whole. Absent paths return `None`.
    pub fn pop(&mut self, path: &Path) -> Option<Value> {
        let highest = self
            .container_at(path)
            .and_then(Container::highest_index);
        match highest {
            Some(index) => {
                let container = self.container_at_mut(path)?;
                container
                    .remove(&Key::Index(index))
                    .map(|node| node.materialize())
            }
            None => self.remove(path),
        }
    }

    /// The contiguous slice of the container at `path` selected by the
    /// bounds, rendered in the container's shape.
    ///
    /// Positions follow materialized order. An `Index` bound on a
    /// list-shaped container is a position (clamped to the length); any
    /// other bound resolves to the position of that exact key, or the end
    /// when absent. `from = None` means the start, `to = None` the end;
    /// `from` is inclusive, `to` exclusive. Absent paths and scalars yield
    /// an empty map.
    pub fn get_range(&self, path: &Path, from: Option<&Key>, to: Option<&Key>) -> Value {
        let Some(container) = self.container_at(path) else {
            return Value::Object(Map::new());
        };
        let ordered = container.ordered_keys();
        let (start, end) = range_positions(container, &ordered, from, to);
        match container.shape() {
            Shape::List => {
                let items = ordered[start..end]
                    .iter()
                    .filter_map(|key| container.child(key))
                    .map(Node::materialize)
                    .collect();
                Value::Array(items)
            }
            Shape::Map => {
                let mut map = Map::new();
                for key in &ordered[start..end] {
                    if let Some(node) = container.child(key) {
                        map.insert(key.to_string(), node.materialize());
                    }
                }
                Value::Object(map)
            }
        }
    }

    /// Remove the slice [`get_range`] would select and return it.
    ///
    /// [`get_range`]: Store::get_range
    pub fn remove_range(&mut self, path: &Path, from: Option<&Key>, to: Option<&Key>) -> Value {
        let Some(container) = self.container_at_mut(path) else {
            return Value::Object(Map::new());
        };
        let shape = container.shape();
        let ordered = container.ordered_keys();
        let (start, end) = range_positions(container, &ordered, from, to);
        let selected = ordered[start..end].to_vec();
        let removed = match shape {
            Shape::List => {
                let items = selected
                    .iter()
                    .filter_map(|key| container.remove_raw(key))
                    .map(|node| node.materialize())
                    .collect();
                Value::Array(items)
            }
            Shape::Map => {
                let mut map = Map::new();
                for key in &selected {
                    if let Some(node) = container.remove_raw(key) {
                        map.insert(key.to_string(), node.materialize());
                    }
                }
                Value::Object(map)
            }
        };
        if shape == Shape::List && !selected.is_empty() {
            container.renumber();
        }
        removed
    }

    /// Whether `path` addresses a node. The root always exists.
    pub fn has_key(&self, path: &Path) -> bool {
        path.is_root() || self.node_at(path).is_some()
    }

    /// Number of immediate children of the container at `path`; scalars and
    /// absent paths count 0.
    pub fn count(&self, path: &Path) -> usize {
        self.container_at(path).map_or(0, Container::len)
    }

    /// Reset the store to an empty root.
    pub fn remove_all(&mut self) {
        self.root = Container::new();
    }

    /// Walk to the node at a non-empty `path` without creating anything.
    fn node_at(&self, path: &Path) -> Option<&Node> {
        let (parents, last) = path.split_last()?;
        let mut current = &self.root;
        for key in parents {
            current = current.child(key)?.as_container()?;
        }
        current.child(last)
    }

    /// The container at `path` (the root for an empty path), read-only.
    fn container_at(&self, path: &Path) -> Option<&Container> {
        if path.is_root() {
            return Some(&self.root);
        }
        self.node_at(path)?.as_container()
    }

    /// The container at `path`, mutable, without creating anything.
    fn container_at_mut(&mut self, path: &Path) -> Option<&mut Container> {
        let Some((parents, last)) = path.split_last() else {
            return Some(&mut self.root);
        };
        let parent = self.descend_existing_mut(parents)?;
        parent.child_mut(last)?.as_container_mut()
    }

    /// Walk `segments` creating container hops as needed, replacing scalars
    /// in the way, and return the final container.
    fn descend_creating(&mut self, segments: &[Key]) -> &mut Container {
        let mut current = &mut self.root;
        for key in segments {
            current = current.container_child_mut(key.clone());
        }
        current
    }

    /// Walk `segments` without creating anything.
    fn descend_existing_mut(&mut self, segments: &[Key]) -> Option<&mut Container> {
        let mut current = &mut self.root;
        for key in segments {
            current = current.child_mut(key)?.as_container_mut()?;
        }
        Some(current)
    }

    /// The container at `path` for appending: absent paths get a fresh
    /// container, a scalar at `path` is wrapped with its old value at
    /// index 0.
    fn mount_container(&mut self, path: &Path) -> &mut Container {
        let Some((parents, last)) = path.split_last() else {
            return &mut self.root;
        };
        let parent = self.descend_creating(parents);
        let child = parent.child_or_insert_with(last.clone(), Node::empty_container);
        if let Node::Scalar(scalar) = child {
            let mut wrapped = Container::new();
            wrapped.insert(Key::Index(0), Node::Scalar(scalar.clone()));
            *child = Node::Container(wrapped);
        }
        match child {
            Node::Container(container) => container,
            _ => unreachable!("just assigned a container"),
        }
    }
}

/// Resolve range bounds to positions in `ordered`, clamped and ordered so
/// slicing cannot panic.
fn range_positions(
    container: &Container,
    ordered: &[Key],
    from: Option<&Key>,
    to: Option<&Key>,
) -> (usize, usize) {
    let len = ordered.len();
    let position = |bound: &Key| -> usize {
        if container.shape() == Shape::List
            && let Key::Index(i) = bound
        {
            return (*i).min(len);
        }
        ordered.iter().position(|key| key == bound).unwrap_or(len)
    };
    let start = from.map_or(0, position);
    let end = to.map_or(len, position);
    (start, start.max(end))
}
