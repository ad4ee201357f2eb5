use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use civpds_store::car::{read_section_at, CarReader};
use civpds_store::{Block, BlockStore, ObjectStorage, StoreError, StoreResult};
use civpds_types::cbor::verify_cid;
use civpds_types::{Cid, Uid};
use tracing::{debug, trace};

use crate::meta::{BlockRef, ShardIndex};

/// Read-only block view over one actor's shards.
///
/// Every block read is checked against its CID before it is returned or
/// cached. Blocks stay cached for the life of the view.
pub struct ActorView {
    index: ShardIndex,
    objects: Arc<dyn ObjectStorage>,
    actor: Uid,
    cache: RwLock<HashMap<Cid, Bytes>>,
    prefetch: bool,
    prefetch_limit: u64,
}

impl ActorView {
    pub fn new(
        index: ShardIndex,
        objects: Arc<dyn ObjectStorage>,
        actor: Uid,
        prefetch: bool,
        prefetch_limit: u64,
    ) -> Self {
        Self {
            index,
            objects,
            actor,
            cache: RwLock::new(HashMap::new()),
            prefetch,
            prefetch_limit,
        }
    }

    pub fn actor(&self) -> Uid {
        self.actor
    }

    /// Number of cached blocks.
    pub fn cached(&self) -> usize {
        self.cache.read().expect("lock poisoned").len()
    }

    fn cached_block(&self, cid: &Cid) -> Option<Bytes> {
        self.cache.read().expect("lock poisoned").get(cid).cloned()
    }

    async fn locate(&self, cid: &Cid) -> StoreResult<BlockRef> {
        self.index
            .lookup_block_ref(*cid, self.actor)
            .await
            .map_err(StoreError::from)?
            .ok_or(StoreError::NotFound(*cid))
    }

    /// Read the single section at the ref's offset.
    async fn read_one(&self, cid: &Cid, loc: &BlockRef) -> StoreResult<Bytes> {
        let bytes = self.objects.get_range(&loc.path, loc.byte_offset).await?;
        let section = read_section_at(&bytes, 0)?.ok_or_else(|| {
            StoreError::InvalidCar(format!("no section at {}:{}", loc.path, loc.byte_offset))
        })?;
        if section.cid != *cid {
            return Err(StoreError::CidMismatch {
                expected: *cid,
                actual: section.cid,
            });
        }
        let block = Block::verified(*cid, section.data.to_vec())?;
        self.cache
            .write()
            .expect("lock poisoned")
            .insert(*cid, block.data.clone());
        Ok(block.data)
    }

    /// Fetch the whole shard, caching every block that verifies.
    async fn prefetch_shard(&self, cid: &Cid, loc: &BlockRef) -> StoreResult<Bytes> {
        let bytes = self.objects.get(&loc.path).await?;
        let mut reader = CarReader::new(&bytes)?;
        let mut found = None;
        let mut loaded = 0usize;
        {
            let mut cache = self.cache.write().expect("lock poisoned");
            while let Some(section) = reader.next_section()? {
                if !verify_cid(&section.cid, section.data) {
                    debug!(path = %loc.path, cid = %section.cid, "skipping block with bad hash");
                    continue;
                }
                let data = Bytes::copy_from_slice(section.data);
                if section.cid == *cid {
                    found = Some(data.clone());
                }
                cache.entry(section.cid).or_insert(data);
                loaded += 1;
            }
        }
        trace!(path = %loc.path, blocks = loaded, "prefetched shard");
        match found {
            Some(data) => Ok(data),
            None => Err(StoreError::InvalidCar(format!(
                "shard {} does not contain indexed block {cid}",
                loc.path
            ))),
        }
    }
}

#[async_trait]
impl BlockStore for ActorView {
    async fn get(&self, cid: &Cid) -> StoreResult<Bytes> {
        if let Some(data) = self.cached_block(cid) {
            return Ok(data);
        }
        let loc = self.locate(cid).await?;
        if loc.owner != self.actor || !self.prefetch {
            return self.read_one(cid, &loc).await;
        }
        let size = self.objects.size(&loc.path).await?;
        if size > self.prefetch_limit {
            return self.read_one(cid, &loc).await;
        }
        self.prefetch_shard(cid, &loc).await
    }

    /// Only blocks stored under this actor count; the cache may hold
    /// blocks read from other actors' shards.
    async fn has(&self, cid: &Cid) -> StoreResult<bool> {
        self.index
            .owns_block(*cid, self.actor)
            .await
            .map_err(StoreError::from)
    }

    async fn put(&self, _block: Block) -> StoreResult<()> {
        Err(StoreError::ReadOnly)
    }

    async fn delete_block(&self, _cid: &Cid) -> StoreResult<()> {
        Err(StoreError::ReadOnly)
    }
}
