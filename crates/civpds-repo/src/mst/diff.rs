//! Tree-level diff between two MSTs.
//!
//! Both trees are walked as ordered streams of leaves and subtrees. When the
//! two streams are positioned on subtrees with the same CID the whole
//! subtree is skipped; otherwise subtrees are expanded in place and leaves
//! are merged by key. Only nodes that actually differ are loaded.

use civpds_store::BlockStore;
use civpds_types::Cid;

use super::node::{Item, Link, Node};
use super::Tree;
use crate::error::RepoResult;

/// Kind of change to a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffOp {
    Add,
    Mut,
    Del,
}

impl DiffOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffOp::Add => "create",
            DiffOp::Mut => "update",
            DiffOp::Del => "delete",
        }
    }
}

/// One key that differs between two trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub op: DiffOp,
    pub key: String,
    pub old: Option<Cid>,
    pub new: Option<Cid>,
}

enum Frame<'a> {
    Leaf(String, Cid),
    Node(&'a Node),
    Stored(Cid, u32),
}

impl Frame<'_> {
    fn is_subtree(&self) -> bool {
        !matches!(self, Frame::Leaf(..))
    }

    fn subtree_cid(&self) -> Option<Cid> {
        match self {
            Frame::Leaf(..) => None,
            Frame::Node(node) => node.cid,
            Frame::Stored(cid, _) => Some(*cid),
        }
    }
}

struct Cursor<'a> {
    store: &'a dyn BlockStore,
    stack: Vec<Frame<'a>>,
}

impl<'a> Cursor<'a> {
    fn new(tree: &'a Tree) -> Self {
        let mut cursor = Self {
            store: tree.store().as_ref(),
            stack: Vec::new(),
        };
        cursor.push_node(tree.root_node());
        cursor
    }

    fn push_node(&mut self, node: &'a Node) {
        for item in node.items.iter().rev() {
            self.stack.push(match item {
                Item::Leaf { key, value } => Frame::Leaf(key.clone(), *value),
                Item::Tree(Link::Loaded(child)) => Frame::Node(&**child),
                Item::Tree(Link::Stored(cid)) => Frame::Stored(*cid, node.child_layer()),
            });
        }
    }

    fn peek(&self) -> Option<&Frame<'a>> {
        self.stack.last()
    }

    /// Replace the subtree on top of the stack with its items.
    async fn expand(&mut self) -> RepoResult<()> {
        match self.stack.pop() {
            Some(Frame::Node(node)) => self.push_node(node),
            Some(Frame::Stored(cid, layer)) => {
                let node = Node::load(self.store, &cid, layer).await?;
                let child_layer = node.child_layer();
                for item in node.items.into_iter().rev() {
                    self.stack.push(match item {
                        Item::Leaf { key, value } => Frame::Leaf(key, value),
                        Item::Tree(link) => match link.known_cid() {
                            Some(cid) => Frame::Stored(cid, child_layer),
                            None => continue,
                        },
                    });
                }
            }
            Some(leaf @ Frame::Leaf(..)) => self.stack.push(leaf),
            None => {}
        }
        Ok(())
    }
}

/// Changes that turn `old` into `new`, in key order.
pub async fn diff(old: &Tree, new: &Tree) -> RepoResult<Vec<TreeChange>> {
    let mut a = Cursor::new(old);
    let mut b = Cursor::new(new);
    let mut changes = Vec::new();

    loop {
        let (fa, fb) = (a.peek(), b.peek());
        match (fa, fb) {
            (None, None) => break,
            (Some(x), Some(y)) if x.is_subtree() && y.is_subtree() => {
                match (x.subtree_cid(), y.subtree_cid()) {
                    (Some(cx), Some(cy)) if cx == cy => {
                        a.stack.pop();
                        b.stack.pop();
                    }
                    _ => {
                        a.expand().await?;
                        b.expand().await?;
                    }
                }
            }
            (Some(x), _) if x.is_subtree() => a.expand().await?,
            (_, Some(y)) if y.is_subtree() => b.expand().await?,
            (Some(Frame::Leaf(ka, va)), Some(Frame::Leaf(kb, vb))) => {
                if ka < kb {
                    changes.push(TreeChange {
                        op: DiffOp::Del,
                        key: ka.clone(),
                        old: Some(*va),
                        new: None,
                    });
                    a.stack.pop();
                } else if ka > kb {
                    changes.push(TreeChange {
                        op: DiffOp::Add,
                        key: kb.clone(),
                        old: None,
                        new: Some(*vb),
                    });
                    b.stack.pop();
                } else {
                    if va != vb {
                        changes.push(TreeChange {
                            op: DiffOp::Mut,
                            key: ka.clone(),
                            old: Some(*va),
                            new: Some(*vb),
                        });
                    }
                    a.stack.pop();
                    b.stack.pop();
                }
            }
            (Some(Frame::Leaf(ka, va)), None) => {
                changes.push(TreeChange {
                    op: DiffOp::Del,
                    key: ka.clone(),
                    old: Some(*va),
                    new: None,
                });
                a.stack.pop();
            }
            (None, Some(Frame::Leaf(kb, vb))) => {
                changes.push(TreeChange {
                    op: DiffOp::Add,
                    key: kb.clone(),
                    old: None,
                    new: Some(*vb),
                });
                b.stack.pop();
            }
            _ => break,
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use civpds_store::MemBlockStore;
    use civpds_types::cid_for_cbor;
    use proptest::prelude::*;

    fn val(tag: &str) -> Cid {
        cid_for_cbor(tag.as_bytes())
    }

    async fn tree_of(store: Arc<dyn BlockStore>, pairs: &BTreeMap<String, Cid>) -> Tree {
        let mut tree = Tree::empty(store);
        for (k, v) in pairs {
            tree.add(k, *v).await.unwrap();
        }
        tree.flush().await.unwrap();
        tree
    }

    #[tokio::test]
    async fn identical_trees_have_no_changes() {
        let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new());
        let pairs: BTreeMap<String, Cid> = (0..100)
            .map(|i| (format!("com.example.post/{i:04}"), val(&i.to_string())))
            .collect();
        let a = tree_of(store.clone(), &pairs).await;
        let b = tree_of(store, &pairs).await;
        assert!(diff(&a, &b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reports_add_mut_del() {
        let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new());
        let old: BTreeMap<String, Cid> = [
            ("com.example.follow/1", "f1"),
            ("com.example.post/1", "p1"),
            ("com.example.post/2", "p2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), val(v)))
        .collect();
        let mut new = old.clone();
        new.remove("com.example.follow/1");
        new.insert("com.example.post/2".into(), val("p2-edited"));
        new.insert("com.example.post/3".into(), val("p3"));

        let a = tree_of(store.clone(), &old).await;
        let b = tree_of(store, &new).await;
        let changes = diff(&a, &b).await.unwrap();
        assert_eq!(
            changes,
            vec![
                TreeChange {
                    op: DiffOp::Del,
                    key: "com.example.follow/1".into(),
                    old: Some(val("f1")),
                    new: None,
                },
                TreeChange {
                    op: DiffOp::Mut,
                    key: "com.example.post/2".into(),
                    old: Some(val("p2")),
                    new: Some(val("p2-edited")),
                },
                TreeChange {
                    op: DiffOp::Add,
                    key: "com.example.post/3".into(),
                    old: None,
                    new: Some(val("p3")),
                },
            ]
        );
    }

    #[tokio::test]
    async fn diff_against_reloaded_tree_reads_only_changed_nodes() {
        let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new());
        let pairs: BTreeMap<String, Cid> = (0..400)
            .map(|i| (format!("com.example.post/{i:04}"), val(&i.to_string())))
            .collect();
        let a = tree_of(store.clone(), &pairs).await;
        let root = a.root_cid().unwrap();

        let mut b = Tree::load(store.clone(), &root).await.unwrap();
        b.update("com.example.post/0123", val("changed")).await.unwrap();
        b.flush().await.unwrap();

        let reopened_old = Tree::load(store, &root).await.unwrap();
        let changes = diff(&reopened_old, &b).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].op, DiffOp::Mut);
        assert_eq!(changes[0].key, "com.example.post/0123");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn applying_diff_reproduces_new_tree(
            old_keys in proptest::collection::btree_map(0u32..600, 0u8..3, 0..80),
            new_keys in proptest::collection::btree_map(0u32..600, 0u8..3, 0..80),
        ) {
            let to_pairs = |m: &BTreeMap<u32, u8>| -> BTreeMap<String, Cid> {
                m.iter()
                    .map(|(k, v)| (format!("com.example.post/{k}"), val(&format!("{k}-{v}"))))
                    .collect()
            };
            let old = to_pairs(&old_keys);
            let new = to_pairs(&new_keys);
            let changes = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .block_on(async {
                    let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new());
                    let a = tree_of(store.clone(), &old).await;
                    let b = tree_of(store, &new).await;
                    diff(&a, &b).await.unwrap()
                });

            let mut applied = old.clone();
            for change in &changes {
                match change.op {
                    DiffOp::Add | DiffOp::Mut => {
                        applied.insert(change.key.clone(), change.new.unwrap());
                    }
                    DiffOp::Del => {
                        applied.remove(&change.key);
                    }
                }
            }
            prop_assert_eq!(applied, new);
        }
    }
}
