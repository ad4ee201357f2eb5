use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use civpds_types::Cid;

use crate::block::Block;
use crate::error::{StoreError, StoreResult};
use crate::traits::BlockStore;

/// In-memory, HashMap-based block store.
///
/// Used as the scratch store when parsing imported CAR files and in tests.
/// Blocks are held behind a `RwLock`; `Bytes` makes reads cheap clones.
pub struct MemBlockStore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Build a store pre-populated with `blocks`.
    pub fn from_blocks(blocks: impl IntoIterator<Item = Block>) -> Self {
        let map = blocks.into_iter().map(|b| (b.cid, b.data)).collect();
        Self {
            blocks: RwLock::new(map),
        }
    }

    /// Number of blocks currently stored.
    pub fn len(&self) -> usize {
        self.blocks.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().expect("lock poisoned").is_empty()
    }

    /// All CIDs in the store.
    pub fn cids(&self) -> Vec<Cid> {
        self.blocks
            .read()
            .expect("lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Non-async lookup for callers that already hold a snapshot.
    pub fn get_sync(&self, cid: &Cid) -> Option<Bytes> {
        self.blocks.read().expect("lock poisoned").get(cid).cloned()
    }
}

impl Default for MemBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockStore for MemBlockStore {
    async fn get(&self, cid: &Cid) -> StoreResult<Bytes> {
        self.get_sync(cid).ok_or(StoreError::NotFound(*cid))
    }

    async fn has(&self, cid: &Cid) -> StoreResult<bool> {
        Ok(self.blocks.read().expect("lock poisoned").contains_key(cid))
    }

    async fn put(&self, block: Block) -> StoreResult<()> {
        self.blocks
            .write()
            .expect("lock poisoned")
            .entry(block.cid)
            .or_insert(block.data);
        Ok(())
    }

    async fn delete_block(&self, cid: &Cid) -> StoreResult<()> {
        self.blocks.write().expect("lock poisoned").remove(cid);
        Ok(())
    }
}

impl std::fmt::Debug for MemBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlockStore")
            .field("block_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civpds_types::Ipld;

    fn block(n: i128) -> Block {
        Block::encode(&Ipld::Integer(n)).unwrap()
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = MemBlockStore::new();
        let b = block(1);
        store.put(b.clone()).await.unwrap();
        assert_eq!(store.get(&b.cid).await.unwrap(), b.data);
        assert!(store.has(&b.cid).await.unwrap());
        assert_eq!(store.get_size(&b.cid).await.unwrap(), b.len());
    }

    #[tokio::test]
    async fn missing_block_is_not_found() {
        let store = MemBlockStore::new();
        let err = store.get(&block(2).cid).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let store = MemBlockStore::new();
        let b = block(3);
        store.put(b.clone()).await.unwrap();
        store.put(b).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_block() {
        let store = MemBlockStore::from_blocks(vec![block(4), block(5)]);
        store.delete_block(&block(4).cid).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(!store.has(&block(4).cid).await.unwrap());
    }

    #[tokio::test]
    async fn works_through_arc() {
        let store: std::sync::Arc<dyn BlockStore> = std::sync::Arc::new(MemBlockStore::new());
        store.put_many(vec![block(6), block(7)]).await.unwrap();
        assert!(store.has(&block(7).cid).await.unwrap());
    }
}
