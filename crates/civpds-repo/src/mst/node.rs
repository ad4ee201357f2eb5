//! MST node model and its DAG-CBOR form.
//!
//! A node holds an ordered run of items: leaves (`key -> record cid`) and
//! subtree pointers. Two subtree pointers are never adjacent, and a subtree
//! only ever holds keys that sort between its neighbouring leaves.
//!
//! On the wire a node is `{l: link|null, e: [{p, k, v, t}]}` where `l` is the
//! leftmost subtree, each entry's key is prefix-compressed against the
//! previous entry (`p` shared bytes, `k` the remaining suffix), `v` is the
//! record CID and `t` the subtree to the entry's right.

use std::collections::BTreeMap;

use civpds_store::{Block, BlockStore};
use civpds_types::cbor;
use civpds_types::{Cid, Ipld};
use sha2::{Digest, Sha256};

use crate::error::{RepoError, RepoResult};

/// Layer of a key: leading zero bits of its SHA-256, counted in pairs
/// (fanout 4).
pub fn key_height(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut zeros = 0;
    for byte in digest {
        if byte == 0 {
            zeros += 8;
            continue;
        }
        zeros += byte.leading_zeros();
        break;
    }
    zeros / 2
}

/// A subtree pointer, loaded on demand.
#[derive(Debug, Clone)]
pub enum Link {
    Stored(Cid),
    Loaded(Box<Node>),
}

impl Link {
    /// CID of the subtree if known without re-encoding.
    pub fn known_cid(&self) -> Option<Cid> {
        match self {
            Link::Stored(cid) => Some(*cid),
            Link::Loaded(node) => node.cid,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Item {
    Leaf { key: String, value: Cid },
    Tree(Link),
}

impl Item {
    pub fn leaf_key(&self) -> Option<&str> {
        match self {
            Item::Leaf { key, .. } => Some(key),
            Item::Tree(_) => None,
        }
    }
}

/// One MST node.
#[derive(Debug, Clone)]
pub struct Node {
    pub layer: u32,
    pub items: Vec<Item>,
    /// CID of the node as last stored; cleared by any mutation.
    pub cid: Option<Cid>,
}

/// Where a key falls inside a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The leaf at this index holds the key.
    Leaf(usize),
    /// The subtree at this index may hold the key.
    Tree(usize),
    /// The key would be inserted at this index; no subtree covers it.
    Gap(usize),
}

impl Node {
    pub fn empty(layer: u32) -> Self {
        Self {
            layer,
            items: Vec::new(),
            cid: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Index of the first leaf whose key is `>= key`, or `items.len()`.
    pub fn lower_bound(&self, key: &str) -> usize {
        self.items
            .iter()
            .position(|item| matches!(item.leaf_key(), Some(k) if k >= key))
            .unwrap_or(self.items.len())
    }

    pub fn slot(&self, key: &str) -> Slot {
        let j = self.lower_bound(key);
        if matches!(self.items.get(j).and_then(Item::leaf_key), Some(k) if k == key) {
            return Slot::Leaf(j);
        }
        if j > 0 && matches!(self.items[j - 1], Item::Tree(_)) {
            return Slot::Tree(j - 1);
        }
        Slot::Gap(j)
    }

    /// Layer of a node's child subtrees.
    pub fn child_layer(&self) -> u32 {
        self.layer.saturating_sub(1)
    }

    /// Encode as a DAG-CBOR value. Every subtree must already have a CID.
    pub fn to_ipld(&self) -> RepoResult<Ipld> {
        let mut left = None;
        let mut entries: Vec<BTreeMap<String, Ipld>> = Vec::new();
        let mut prev_key: &[u8] = &[];
        for item in &self.items {
            match item {
                Item::Tree(link) => {
                    let cid = link.known_cid().ok_or(RepoError::NotLoaded)?;
                    match entries.last_mut() {
                        Some(entry) => {
                            entry.insert("t".into(), Ipld::Link(cid));
                        }
                        None => left = Some(cid),
                    }
                }
                Item::Leaf { key, value } => {
                    let key = key.as_bytes();
                    let shared = prev_key
                        .iter()
                        .zip(key)
                        .take_while(|(a, b)| a == b)
                        .count();
                    entries.push(BTreeMap::from([
                        ("p".to_string(), Ipld::Integer(shared as i128)),
                        ("k".to_string(), Ipld::Bytes(key[shared..].to_vec())),
                        ("v".to_string(), Ipld::Link(*value)),
                        ("t".to_string(), Ipld::Null),
                    ]));
                    prev_key = key;
                }
            }
        }
        Ok(Ipld::Map(BTreeMap::from([
            ("l".to_string(), cbor::opt_link(left)),
            (
                "e".to_string(),
                Ipld::List(entries.into_iter().map(Ipld::Map).collect()),
            ),
        ])))
    }

    /// Decode a stored node. `layer` is the layer it is expected at; a node
    /// with leaves takes its layer from its first key instead.
    pub fn decode(cid: Cid, bytes: &[u8], layer: u32) -> RepoResult<Self> {
        const WHAT: &str = "mst node";
        let value = cbor::decode(bytes)?;
        let map = cbor::as_map(&value, WHAT)?;
        let mut items = Vec::new();
        if let Some(left) = cbor::get_opt_link(map, "l", WHAT)? {
            items.push(Item::Tree(Link::Stored(left)));
        }
        let mut prev_key: Vec<u8> = Vec::new();
        for entry in cbor::get_list(map, "e", WHAT)? {
            let entry = cbor::as_map(entry, WHAT)?;
            let shared = cbor::get_int(entry, "p", WHAT)? as usize;
            let suffix = cbor::get_bytes(entry, "k", WHAT)?;
            if shared > prev_key.len() {
                return Err(RepoError::MalformedNode(format!(
                    "prefix length {shared} exceeds previous key"
                )));
            }
            let mut key = prev_key[..shared].to_vec();
            key.extend_from_slice(suffix);
            let key_str = String::from_utf8(key.clone())
                .map_err(|_| RepoError::MalformedNode("key is not utf-8".into()))?;
            if !prev_key.is_empty() && key <= prev_key {
                return Err(RepoError::MalformedNode(format!(
                    "keys out of order at {key_str:?}"
                )));
            }
            items.push(Item::Leaf {
                key: key_str,
                value: cbor::get_link(entry, "v", WHAT)?,
            });
            if let Some(right) = cbor::get_opt_link(entry, "t", WHAT)? {
                items.push(Item::Tree(Link::Stored(right)));
            }
            prev_key = key;
        }
        let layer = items
            .iter()
            .find_map(Item::leaf_key)
            .map(key_height)
            .unwrap_or(layer);
        Ok(Self {
            layer,
            items,
            cid: Some(cid),
        })
    }

    /// Load a stored node.
    pub async fn load(store: &dyn BlockStore, cid: &Cid, layer: u32) -> RepoResult<Self> {
        let bytes = store.get(cid).await?;
        Self::decode(*cid, &bytes, layer)
    }

    /// Assign CIDs to this node and every dirty descendant, appending the
    /// newly encoded blocks to `out`.
    pub fn seal(&mut self, out: &mut Vec<Block>) -> RepoResult<Cid> {
        if let Some(cid) = self.cid {
            return Ok(cid);
        }
        for item in &mut self.items {
            if let Item::Tree(Link::Loaded(child)) = item {
                child.seal(out)?;
            }
        }
        let block = Block::encode(&self.to_ipld()?)?;
        let cid = block.cid;
        out.push(block);
        self.cid = Some(cid);
        Ok(cid)
    }
}

/// Replace a stored link with its loaded node.
pub async fn ensure_loaded(store: &dyn BlockStore, link: &mut Link, layer: u32) -> RepoResult<()> {
    if let Link::Stored(cid) = link {
        let node = Node::load(store, cid, layer).await?;
        *link = Link::Loaded(Box::new(node));
    }
    Ok(())
}

/// Mutable access to a link that must already be loaded.
pub fn loaded_mut(link: &mut Link) -> RepoResult<&mut Node> {
    match link {
        Link::Loaded(node) => Ok(&mut **node),
        Link::Stored(_) => Err(RepoError::NotLoaded),
    }
}

/// Take ownership of a loaded link.
pub fn into_loaded(link: Link) -> RepoResult<Node> {
    match link {
        Link::Loaded(node) => Ok(*node),
        Link::Stored(_) => Err(RepoError::NotLoaded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civpds_types::cid_for_cbor;

    fn leaf(key: &str) -> Item {
        Item::Leaf {
            key: key.to_string(),
            value: cid_for_cbor(key.as_bytes()),
        }
    }

    #[test]
    fn height_counts_zero_bit_pairs() {
        for i in 0..500 {
            let key = format!("com.example.post/{i}");
            let digest = Sha256::digest(key.as_bytes());
            let mut head = [0u8; 16];
            head.copy_from_slice(&digest[..16]);
            let zeros = u128::from_be_bytes(head).leading_zeros();
            assert_eq!(key_height(&key), zeros / 2, "{key}");
        }
        let tallest = (0..2000)
            .map(|i| key_height(&format!("com.example.post/{i}")))
            .max()
            .unwrap();
        assert!(tallest >= 2);
    }

    #[test]
    fn slot_finds_leaf_tree_and_gap() {
        let node = Node {
            layer: 1,
            items: vec![
                Item::Tree(Link::Stored(cid_for_cbor(b"left"))),
                leaf("b/1"),
                leaf("d/1"),
                Item::Tree(Link::Stored(cid_for_cbor(b"right"))),
            ],
            cid: None,
        };
        assert_eq!(node.slot("a/1"), Slot::Tree(0));
        assert_eq!(node.slot("b/1"), Slot::Leaf(1));
        assert_eq!(node.slot("c/1"), Slot::Gap(2));
        assert_eq!(node.slot("e/1"), Slot::Tree(3));
    }

    #[test]
    fn encode_decode_preserves_items() {
        let sub = cid_for_cbor(b"sub");
        let node = Node {
            layer: 0,
            items: vec![
                leaf("com.example.post/aaa"),
                Item::Tree(Link::Stored(sub)),
                leaf("com.example.post/aab"),
            ],
            cid: None,
        };
        let block = Block::encode(&node.to_ipld().unwrap()).unwrap();
        let back = Node::decode(block.cid, &block.data, 0).unwrap();
        assert_eq!(back.items.len(), 3);
        assert_eq!(back.items[0].leaf_key(), Some("com.example.post/aaa"));
        assert!(matches!(back.items[1], Item::Tree(Link::Stored(c)) if c == sub));
        assert_eq!(back.items[2].leaf_key(), Some("com.example.post/aab"));
        assert_eq!(back.layer, key_height("com.example.post/aaa"));
    }

    #[test]
    fn keys_are_prefix_compressed() {
        let node = Node {
            layer: 0,
            items: vec![leaf("com.example.post/aaa"), leaf("com.example.post/aab")],
            cid: None,
        };
        let Ipld::Map(map) = node.to_ipld().unwrap() else {
            panic!("node is a map")
        };
        let Some(Ipld::List(entries)) = map.get("e") else {
            panic!("entries")
        };
        let Ipld::Map(second) = &entries[1] else {
            panic!("entry")
        };
        assert_eq!(second.get("p"), Some(&Ipld::Integer(19)));
        assert_eq!(second.get("k"), Some(&Ipld::Bytes(b"b".to_vec())));
    }

    #[test]
    fn out_of_order_keys_are_rejected() {
        let value = cid_for_cbor(b"v");
        let bad = Ipld::Map(BTreeMap::from([
            ("l".to_string(), Ipld::Null),
            (
                "e".to_string(),
                Ipld::List(vec![
                    Ipld::Map(BTreeMap::from([
                        ("p".to_string(), Ipld::Integer(0)),
                        ("k".to_string(), Ipld::Bytes(b"b/1".to_vec())),
                        ("v".to_string(), Ipld::Link(value)),
                        ("t".to_string(), Ipld::Null),
                    ])),
                    Ipld::Map(BTreeMap::from([
                        ("p".to_string(), Ipld::Integer(0)),
                        ("k".to_string(), Ipld::Bytes(b"a/1".to_vec())),
                        ("v".to_string(), Ipld::Link(value)),
                        ("t".to_string(), Ipld::Null),
                    ])),
                ]),
            ),
        ]));
        let block = Block::encode(&bad).unwrap();
        assert!(matches!(
            Node::decode(block.cid, &block.data, 0),
            Err(RepoError::MalformedNode(_))
        ));
    }
}
