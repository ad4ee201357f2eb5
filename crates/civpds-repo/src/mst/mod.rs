//! Merkle Search Tree.
//!
//! The shape of the tree is a pure function of its key set: every key sits
//! at the layer given by [`key_height`], and empty subtrees are pruned. Two
//! trees with the same `key -> cid` pairs therefore encode to the same root
//! CID no matter the order in which keys were inserted.
//!
//! Nodes are loaded lazily from the backing [`BlockStore`]. Mutations first
//! load the nodes along the key's search path (plus, for deletes, the
//! spines that will be merged) and then rewrite the in-memory tree
//! synchronously. [`Tree::flush`] encodes dirty nodes and writes them back.

mod diff;
pub mod node;

use std::sync::Arc;

use civpds_store::{Block, BlockStore};
use civpds_types::Cid;

use crate::error::{RepoError, RepoResult};
pub use diff::{diff, DiffOp, TreeChange};
use node::{ensure_loaded, into_loaded, loaded_mut, Item, Link, Node, Slot};
pub use node::key_height;

/// A Merkle Search Tree over a block store.
pub struct Tree {
    store: Arc<dyn BlockStore>,
    root: Node,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("layer", &self.root.layer)
            .field("cid", &self.root.cid)
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

fn validate_key(key: &str) -> RepoResult<()> {
    match key.split_once('/') {
        Some((collection, rkey)) if !collection.is_empty() && !rkey.is_empty() => Ok(()),
        _ => Err(RepoError::InvalidKey(key.to_string())),
    }
}

impl Tree {
    /// An empty tree.
    pub fn empty(store: Arc<dyn BlockStore>) -> Self {
        Self {
            store,
            root: Node::empty(0),
        }
    }

    /// Open the tree rooted at `root`.
    pub async fn load(store: Arc<dyn BlockStore>, root: &Cid) -> RepoResult<Self> {
        let mut node = Node::load(store.as_ref(), root, 0).await?;
        if node.items.iter().all(|i| i.leaf_key().is_none()) && !node.is_empty() {
            // A leafless root sits one layer above its first descendant
            // that carries keys.
            let mut depth = 0;
            let mut cursor = node.clone();
            loop {
                let Some(Item::Tree(link)) = cursor.items.first() else {
                    break;
                };
                let cid = link.known_cid().ok_or(RepoError::NotLoaded)?;
                cursor = Node::load(store.as_ref(), &cid, 0).await?;
                depth += 1;
                if let Some(key) = cursor.items.iter().find_map(Item::leaf_key) {
                    node.layer = key_height(key) + depth;
                    break;
                }
            }
        }
        Ok(Self { store, root: node })
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Returns `true` if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Root CID if the tree has no unflushed changes.
    pub fn root_cid(&self) -> Option<Cid> {
        self.root.cid
    }

    pub(crate) fn root_node(&self) -> &Node {
        &self.root
    }

    /// Load every node on the search path for `key`.
    async fn load_path(&mut self, key: &str) -> RepoResult<()> {
        let store = self.store.clone();
        let mut node = &mut self.root;
        loop {
            let Slot::Tree(i) = node.slot(key) else {
                return Ok(());
            };
            let layer = node.child_layer();
            let Item::Tree(link) = &mut node.items[i] else {
                return Ok(());
            };
            ensure_loaded(store.as_ref(), link, layer).await?;
            node = loaded_mut(link)?;
        }
    }

    /// Load the outermost spine of a subtree on one side.
    async fn load_spine(
        store: &dyn BlockStore,
        mut link: &mut Link,
        mut layer: u32,
        side: Side,
    ) -> RepoResult<()> {
        loop {
            ensure_loaded(store, link, layer).await?;
            let node = loaded_mut(link)?;
            layer = node.child_layer();
            let edge = match side {
                Side::Left => node.items.first_mut(),
                Side::Right => node.items.last_mut(),
            };
            match edge {
                Some(Item::Tree(child)) => link = child,
                _ => return Ok(()),
            }
        }
    }

    /// Load the path to `key` and the spines bordering its leaf.
    async fn load_for_delete(&mut self, key: &str) -> RepoResult<()> {
        self.load_path(key).await?;
        let store = self.store.clone();
        let mut node = &mut self.root;
        loop {
            match node.slot(key) {
                Slot::Leaf(j) => {
                    let layer = node.child_layer();
                    if j > 0 {
                        if let Item::Tree(link) = &mut node.items[j - 1] {
                            Self::load_spine(store.as_ref(), link, layer, Side::Right).await?;
                        }
                    }
                    if let Some(Item::Tree(link)) = node.items.get_mut(j + 1) {
                        Self::load_spine(store.as_ref(), link, layer, Side::Left).await?;
                    }
                    return Ok(());
                }
                Slot::Tree(i) => {
                    let Item::Tree(link) = &mut node.items[i] else {
                        return Ok(());
                    };
                    node = loaded_mut(link)?;
                }
                Slot::Gap(_) => return Ok(()),
            }
        }
    }

    /// Record CID stored under `key`.
    pub async fn get(&self, key: &str) -> RepoResult<Option<Cid>> {
        let mut owned: Option<Node> = None;
        let mut next: Option<(Cid, u32)> = None;
        let mut node = &self.root;
        loop {
            if let Some((cid, layer)) = next.take() {
                owned = Some(Node::load(self.store.as_ref(), &cid, layer).await?);
                node = owned.as_ref().ok_or(RepoError::NotLoaded)?;
            }
            match node.slot(key) {
                Slot::Leaf(j) => {
                    return Ok(match &node.items[j] {
                        Item::Leaf { value, .. } => Some(*value),
                        Item::Tree(_) => None,
                    })
                }
                Slot::Gap(_) => return Ok(None),
                Slot::Tree(i) => match &node.items[i] {
                    Item::Tree(Link::Loaded(child)) if owned.is_none() => node = &**child,
                    Item::Tree(link) => {
                        let cid = link.known_cid().ok_or(RepoError::NotLoaded)?;
                        next = Some((cid, node.child_layer()));
                    }
                    Item::Leaf { .. } => return Ok(None),
                },
            }
        }
    }

    /// Insert a new key. Fails if the key is already present.
    pub async fn add(&mut self, key: &str, value: Cid) -> RepoResult<()> {
        validate_key(key)?;
        self.load_path(key).await?;
        let height = key_height(key);
        if matches!(self.root.slot(key), Slot::Leaf(_)) {
            return Err(RepoError::RecordExists(key.to_string()));
        }
        if height <= self.root.layer {
            return insert(&mut self.root, key, value, height);
        }

        let leaf = Item::Leaf {
            key: key.to_string(),
            value,
        };
        let old = std::mem::replace(&mut self.root, Node::empty(height));
        if old.is_empty() {
            self.root.items.push(leaf);
            return Ok(());
        }
        let (left, right) = split(old, key)?;
        let mut items = Vec::with_capacity(3);
        if let Some(left) = left {
            items.push(Item::Tree(Link::Loaded(Box::new(wrap(left, height - 1)))));
        }
        items.push(leaf);
        if let Some(right) = right {
            items.push(Item::Tree(Link::Loaded(Box::new(wrap(right, height - 1)))));
        }
        self.root.items = items;
        Ok(())
    }

    /// Replace the value of an existing key, returning the previous value.
    pub async fn update(&mut self, key: &str, value: Cid) -> RepoResult<Cid> {
        self.load_path(key).await?;
        replace(&mut self.root, key, value)?.ok_or_else(|| RepoError::RecordNotFound(key.to_string()))
    }

    /// Remove a key, returning its value.
    pub async fn delete(&mut self, key: &str) -> RepoResult<Cid> {
        self.load_for_delete(key).await?;
        let removed = remove(&mut self.root, key)?
            .ok_or_else(|| RepoError::RecordNotFound(key.to_string()))?;
        self.trim_root().await?;
        Ok(removed)
    }

    /// Collapse a root that holds nothing but one subtree.
    async fn trim_root(&mut self) -> RepoResult<()> {
        loop {
            if self.root.is_empty() {
                self.root = Node::empty(0);
                return Ok(());
            }
            if self.root.items.len() != 1 || !matches!(self.root.items[0], Item::Tree(_)) {
                return Ok(());
            }
            let layer = self.root.child_layer();
            let Some(Item::Tree(mut link)) = self.root.items.pop() else {
                return Ok(());
            };
            ensure_loaded(self.store.as_ref(), &mut link, layer).await?;
            self.root = into_loaded(link)?;
        }
    }

    /// Visit leaves in key order starting at the first key `>= from`,
    /// skipping subtrees that lie wholly before it. Stops when `visit`
    /// returns `false`.
    pub async fn walk_leaves_from<F>(&self, from: &str, mut visit: F) -> RepoResult<()>
    where
        F: FnMut(&str, &Cid) -> bool,
    {
        enum Frame<'a> {
            Leaf(String, Cid),
            Node(&'a Node),
            Stored(Cid, u32),
        }

        fn push_items<'a>(stack: &mut Vec<Frame<'a>>, node: &'a Node, from: &str) {
            let j = node.lower_bound(from);
            let start = if j > 0 && matches!(node.items[j - 1], Item::Tree(_)) {
                j - 1
            } else {
                j
            };
            for item in node.items[start..].iter().rev() {
                stack.push(match item {
                    Item::Leaf { key, value } => Frame::Leaf(key.clone(), *value),
                    Item::Tree(Link::Loaded(child)) => Frame::Node(&**child),
                    Item::Tree(Link::Stored(cid)) => Frame::Stored(*cid, node.child_layer()),
                });
            }
        }

        let mut stack = Vec::new();
        push_items(&mut stack, &self.root, from);
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Leaf(key, value) => {
                    if key.as_str() >= from && !visit(&key, &value) {
                        return Ok(());
                    }
                }
                Frame::Node(node) => push_items(&mut stack, node, from),
                Frame::Stored(cid, layer) => {
                    let node = Node::load(self.store.as_ref(), &cid, layer).await?;
                    let j = node.lower_bound(from);
                    let start = if j > 0 && matches!(node.items[j - 1], Item::Tree(_)) {
                        j - 1
                    } else {
                        j
                    };
                    for item in node.items[start..].iter().rev() {
                        stack.push(match item {
                            Item::Leaf { key, value } => Frame::Leaf(key.clone(), *value),
                            Item::Tree(link) => Frame::Stored(
                                link.known_cid().ok_or(RepoError::NotLoaded)?,
                                node.child_layer(),
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Every `(key, cid)` pair in order.
    pub async fn leaves(&self) -> RepoResult<Vec<(String, Cid)>> {
        let mut out = Vec::new();
        self.walk_leaves_from("", |key, cid| {
            out.push((key.to_string(), *cid));
            true
        })
        .await?;
        Ok(out)
    }

    /// Encode dirty nodes and return them without writing.
    pub fn seal(&mut self) -> RepoResult<(Cid, Vec<Block>)> {
        let mut blocks = Vec::new();
        let cid = self.root.seal(&mut blocks)?;
        Ok((cid, blocks))
    }

    /// Write dirty nodes to the store and return the root CID.
    pub async fn flush(&mut self) -> RepoResult<Cid> {
        let (cid, blocks) = self.seal()?;
        if !blocks.is_empty() {
            self.store.put_many(blocks).await?;
        }
        Ok(cid)
    }
}

/// Wrap `node` in single-subtree parents until it reaches `layer`.
fn wrap(mut node: Node, layer: u32) -> Node {
    while node.layer < layer {
        node = Node {
            layer: node.layer + 1,
            items: vec![Item::Tree(Link::Loaded(Box::new(node)))],
            cid: None,
        };
    }
    node
}

/// Insert into a node whose layer is `>= height`. The key's path must be
/// loaded.
fn insert(node: &mut Node, key: &str, value: Cid, height: u32) -> RepoResult<()> {
    if let Slot::Leaf(_) = node.slot(key) {
        return Err(RepoError::RecordExists(key.to_string()));
    }
    node.cid = None;
    let leaf = Item::Leaf {
        key: key.to_string(),
        value,
    };
    match node.slot(key) {
        Slot::Leaf(_) => Err(RepoError::RecordExists(key.to_string())),
        Slot::Tree(i) if height == node.layer => {
            let Item::Tree(link) = node.items.remove(i) else {
                return Err(RepoError::MalformedNode("expected subtree".into()));
            };
            let (left, right) = split(into_loaded(link)?, key)?;
            let mut replacement = Vec::with_capacity(3);
            if let Some(left) = left {
                replacement.push(Item::Tree(Link::Loaded(Box::new(left))));
            }
            replacement.push(leaf);
            if let Some(right) = right {
                replacement.push(Item::Tree(Link::Loaded(Box::new(right))));
            }
            node.items.splice(i..i, replacement);
            Ok(())
        }
        Slot::Gap(j) if height == node.layer => {
            node.items.insert(j, leaf);
            Ok(())
        }
        Slot::Tree(i) => {
            let Item::Tree(link) = &mut node.items[i] else {
                return Err(RepoError::MalformedNode("expected subtree".into()));
            };
            insert(loaded_mut(link)?, key, value, height)
        }
        Slot::Gap(j) => {
            let mut child = Node::empty(node.child_layer());
            insert(&mut child, key, value, height)?;
            node.items
                .insert(j, Item::Tree(Link::Loaded(Box::new(child))));
            Ok(())
        }
    }
}

/// Split a node into the parts before and after `key` (which it must not
/// contain). Empty halves are dropped.
fn split(node: Node, key: &str) -> RepoResult<(Option<Node>, Option<Node>)> {
    let layer = node.layer;
    let slot = node.slot(key);
    let mut left = node.items;
    let (mut right, straddle) = match slot {
        Slot::Leaf(_) => return Err(RepoError::RecordExists(key.to_string())),
        Slot::Gap(j) => (left.split_off(j), None),
        Slot::Tree(i) => {
            let right = left.split_off(i + 1);
            match left.pop() {
                Some(Item::Tree(link)) => (right, Some(into_loaded(link)?)),
                _ => return Err(RepoError::MalformedNode("expected subtree".into())),
            }
        }
    };
    if let Some(child) = straddle {
        let (l, r) = split(child, key)?;
        if let Some(l) = l {
            left.push(Item::Tree(Link::Loaded(Box::new(l))));
        }
        if let Some(r) = r {
            right.insert(0, Item::Tree(Link::Loaded(Box::new(r))));
        }
    }
    let half = |items: Vec<Item>| {
        (!items.is_empty()).then(|| Node {
            layer,
            items,
            cid: None,
        })
    };
    Ok((half(left), half(right)))
}

/// Replace the value at `key`. The key's path must be loaded.
fn replace(node: &mut Node, key: &str, value: Cid) -> RepoResult<Option<Cid>> {
    match node.slot(key) {
        Slot::Leaf(j) => {
            let Item::Leaf { value: old, .. } = &mut node.items[j] else {
                return Ok(None);
            };
            let prev = std::mem::replace(old, value);
            node.cid = None;
            Ok(Some(prev))
        }
        Slot::Tree(i) => {
            let Item::Tree(link) = &mut node.items[i] else {
                return Ok(None);
            };
            let prev = replace(loaded_mut(link)?, key, value)?;
            if prev.is_some() {
                node.cid = None;
            }
            Ok(prev)
        }
        Slot::Gap(_) => Ok(None),
    }
}

/// Remove `key`, merging the subtrees on either side of it. The key's path
/// and bordering spines must be loaded.
fn remove(node: &mut Node, key: &str) -> RepoResult<Option<Cid>> {
    match node.slot(key) {
        Slot::Leaf(j) => {
            let Item::Leaf { value, .. } = node.items.remove(j) else {
                return Ok(None);
            };
            node.cid = None;
            let joinable = j > 0
                && j < node.items.len()
                && matches!(node.items[j - 1], Item::Tree(_))
                && matches!(node.items[j], Item::Tree(_));
            if joinable {
                let right = node.items.remove(j);
                let left = node.items.remove(j - 1);
                let (Item::Tree(l), Item::Tree(r)) = (left, right) else {
                    return Err(RepoError::MalformedNode("expected subtrees".into()));
                };
                let merged = merge(into_loaded(l)?, into_loaded(r)?)?;
                node.items
                    .insert(j - 1, Item::Tree(Link::Loaded(Box::new(merged))));
            }
            Ok(Some(value))
        }
        Slot::Tree(i) => {
            let Item::Tree(link) = &mut node.items[i] else {
                return Ok(None);
            };
            let child = loaded_mut(link)?;
            let removed = remove(child, key)?;
            if removed.is_some() {
                if child.is_empty() {
                    node.items.remove(i);
                }
                node.cid = None;
            }
            Ok(removed)
        }
        Slot::Gap(_) => Ok(None),
    }
}

/// Concatenate two sibling nodes of the same layer, merging the subtrees
/// that meet at the seam.
fn merge(left: Node, right: Node) -> RepoResult<Node> {
    let layer = left.layer;
    let mut items = left.items;
    let mut rest = right.items.into_iter().peekable();
    let seam = matches!(items.last(), Some(Item::Tree(_)))
        && matches!(rest.peek(), Some(Item::Tree(_)));
    if seam {
        let (Some(Item::Tree(l)), Some(Item::Tree(r))) = (items.pop(), rest.next()) else {
            return Err(RepoError::MalformedNode("expected subtrees".into()));
        };
        let merged = merge(into_loaded(l)?, into_loaded(r)?)?;
        items.push(Item::Tree(Link::Loaded(Box::new(merged))));
    }
    items.extend(rest);
    Ok(Node {
        layer,
        items,
        cid: None,
    })
}
