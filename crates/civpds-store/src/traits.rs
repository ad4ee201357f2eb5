use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use civpds_types::Cid;

use crate::block::Block;
use crate::error::StoreResult;

/// Content-addressed block store.
///
/// Repository sessions are written against this trait. Implementations
/// compose: a delta session layers pending writes over an actor view, which
/// layers a read cache over the shard index and object storage.
///
/// Invariants:
/// - `get` of a missing block returns [`StoreError::NotFound`](crate::StoreError::NotFound).
/// - Blocks are immutable; `put` of an existing CID is a no-op.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Read a block's bytes.
    async fn get(&self, cid: &Cid) -> StoreResult<Bytes>;

    /// Check whether a block is present.
    async fn has(&self, cid: &Cid) -> StoreResult<bool>;

    /// Store a block.
    async fn put(&self, block: Block) -> StoreResult<()>;

    /// Remove a block.
    async fn delete_block(&self, cid: &Cid) -> StoreResult<()>;

    /// Size in bytes of a block.
    async fn get_size(&self, cid: &Cid) -> StoreResult<usize> {
        Ok(self.get(cid).await?.len())
    }

    /// Store several blocks.
    ///
    /// Default implementation calls `put()` for each block.
    async fn put_many(&self, blocks: Vec<Block>) -> StoreResult<()> {
        for block in blocks {
            self.put(block).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: BlockStore + ?Sized> BlockStore for Arc<T> {
    async fn get(&self, cid: &Cid) -> StoreResult<Bytes> {
        (**self).get(cid).await
    }

    async fn has(&self, cid: &Cid) -> StoreResult<bool> {
        (**self).has(cid).await
    }

    async fn put(&self, block: Block) -> StoreResult<()> {
        (**self).put(block).await
    }

    async fn delete_block(&self, cid: &Cid) -> StoreResult<()> {
        (**self).delete_block(cid).await
    }

    async fn get_size(&self, cid: &Cid) -> StoreResult<usize> {
        (**self).get_size(cid).await
    }

    async fn put_many(&self, blocks: Vec<Block>) -> StoreResult<()> {
        (**self).put_many(blocks).await
    }
}
