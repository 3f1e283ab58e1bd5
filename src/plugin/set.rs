//! Persistent plugin set
//!
//! An immutable map from plugin id to [`PluginSpec`], stored as an AVL tree
//! whose nodes are shared between versions. Every update copies only the
//! path from the root to the touched node, so older versions stay valid and
//! cheap to hold on to.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::plugin::spec::PluginSpec;

type Link = Option<Arc<Node>>;

#[derive(Debug)]
struct Node {
    key: Arc<str>,
    value: Arc<PluginSpec>,
    left: Link,
    right: Link,
    height: u8,
    size: usize,
}

fn height(link: &Link) -> u8 {
    link.as_ref().map_or(0, |n| n.height)
}

fn size(link: &Link) -> usize {
    link.as_ref().map_or(0, |n| n.size)
}

fn make(key: Arc<str>, value: Arc<PluginSpec>, left: Link, right: Link) -> Arc<Node> {
    Arc::new(Node {
        height: 1 + height(&left).max(height(&right)),
        size: 1 + size(&left) + size(&right),
        key,
        value,
        left,
        right,
    })
}

// Rebuild a node whose subtrees differ in height by at most two.
fn balance(key: Arc<str>, value: Arc<PluginSpec>, left: Link, right: Link) -> Arc<Node> {
    let (hl, hr) = (height(&left), height(&right));

    if hl > hr + 1 {
        if let Some(l) = left.as_deref() {
            if height(&l.left) >= height(&l.right) {
                let new_right = make(key, value, l.right.clone(), right);
                return make(l.key.clone(), l.value.clone(), l.left.clone(), Some(new_right));
            }
            if let Some(lr) = l.right.as_deref() {
                let new_left = make(l.key.clone(), l.value.clone(), l.left.clone(), lr.left.clone());
                let new_right = make(key, value, lr.right.clone(), right);
                return make(lr.key.clone(), lr.value.clone(), Some(new_left), Some(new_right));
            }
        }
    } else if hr > hl + 1 {
        if let Some(r) = right.as_deref() {
            if height(&r.right) >= height(&r.left) {
                let new_left = make(key, value, left, r.left.clone());
                return make(r.key.clone(), r.value.clone(), Some(new_left), r.right.clone());
            }
            if let Some(rl) = r.left.as_deref() {
                let new_left = make(key, value, left, rl.left.clone());
                let new_right = make(r.key.clone(), r.value.clone(), rl.right.clone(), r.right.clone());
                return make(rl.key.clone(), rl.value.clone(), Some(new_left), Some(new_right));
            }
        }
    }

    make(key, value, left, right)
}

// With `replace` unset an existing key keeps its value.
fn insert(link: &Link, key: Arc<str>, value: Arc<PluginSpec>, replace: bool) -> Arc<Node> {
    let Some(node) = link else {
        return make(key, value, None, None);
    };

    match key.as_ref().cmp(node.key.as_ref()) {
        Ordering::Less => balance(
            node.key.clone(),
            node.value.clone(),
            Some(insert(&node.left, key, value, replace)),
            node.right.clone(),
        ),
        Ordering::Greater => balance(
            node.key.clone(),
            node.value.clone(),
            node.left.clone(),
            Some(insert(&node.right, key, value, replace)),
        ),
        Ordering::Equal if replace => make(key, value, node.left.clone(), node.right.clone()),
        Ordering::Equal => node.clone(),
    }
}

/// Immutable, structurally shared set of plugin specs keyed by id
#[derive(Clone, Default)]
pub struct PluginSet {
    root: Link,
}

impl PluginSet {
    /// The empty set
    pub const EMPTY: PluginSet = PluginSet { root: None };

    pub fn new() -> Self {
        Self::EMPTY
    }

    pub fn from_specs(specs: impl IntoIterator<Item = PluginSpec>) -> Self {
        Self::EMPTY.add(specs)
    }

    /// New set with `specs` added; later duplicates in `specs` win.
    pub fn add(&self, specs: impl IntoIterator<Item = PluginSpec>) -> PluginSet {
        let mut root = self.root.clone();
        for spec in specs {
            let key: Arc<str> = Arc::from(spec.id.as_str());
            root = Some(insert(&root, key, Arc::new(spec), true));
        }
        PluginSet { root }
    }

    /// Union of both sets; on a shared id the entry from `other` wins.
    ///
    /// Runs in O(m log n) where m is the size of the smaller set.
    pub fn merge(&self, other: &PluginSet) -> PluginSet {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }

        let (mut root, smaller, replace) = if other.len() <= self.len() {
            (self.root.clone(), other, true)
        } else {
            (other.root.clone(), self, false)
        };

        for node in smaller.nodes() {
            root = Some(insert(&root, node.key.clone(), node.value.clone(), replace));
        }
        PluginSet { root }
    }

    pub fn lookup(&self, key: &str) -> Option<&PluginSpec> {
        let mut link = &self.root;
        while let Some(node) = link {
            match key.cmp(node.key.as_ref()) {
                Ordering::Less => link = &node.left,
                Ordering::Greater => link = &node.right,
                Ordering::Equal => return Some(node.value.as_ref()),
            }
        }
        None
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// All ids in sorted order
    pub fn keys(&self) -> Vec<&str> {
        self.nodes().map(|n| n.key.as_ref()).collect()
    }

    /// `(id, spec)` pairs in sorted id order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PluginSpec)> {
        self.nodes().map(|n| (n.key.as_ref(), n.value.as_ref()))
    }

    pub fn values(&self) -> impl Iterator<Item = &PluginSpec> {
        self.nodes().map(|n| n.value.as_ref())
    }

    pub fn for_each(&self, mut f: impl FnMut(&PluginSpec)) {
        for node in self.nodes() {
            f(node.value.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn nodes(&self) -> Nodes<'_> {
        let mut nodes = Nodes { stack: Vec::new() };
        nodes.push_left(&self.root);
        nodes
    }
}

// In-order traversal with an explicit stack.
struct Nodes<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Nodes<'a> {
    fn push_left(&mut self, mut link: &'a Link) {
        while let Some(node) = link {
            self.stack.push(node.as_ref());
            link = &node.left;
        }
    }
}

impl<'a> Iterator for Nodes<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left(&node.right);
        Some(node)
    }
}

impl PartialEq for PluginSet {
    fn eq(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (Some(a), Some(b)) if Arc::ptr_eq(a, b) => true,
            _ => {
                self.len() == other.len()
                    && self
                        .nodes()
                        .zip(other.nodes())
                        .all(|(a, b)| a.key == b.key && a.value == b.value)
            }
        }
    }
}

impl Eq for PluginSet {}

impl FromIterator<PluginSpec> for PluginSet {
    fn from_iter<I: IntoIterator<Item = PluginSpec>>(iter: I) -> Self {
        PluginSet::from_specs(iter)
    }
}

impl fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl fmt::Display for PluginSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, spec)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", key, spec)?;
        }
        write!(f, "}}")
    }
}

impl Serialize for PluginSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.values())
    }
}

impl<'de> Deserialize<'de> for PluginSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let specs = Option::<Vec<PluginSpec>>::deserialize(deserializer)?;
        Ok(PluginSet::from_specs(specs.unwrap_or_default()))
    }
}
