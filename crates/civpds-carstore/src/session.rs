use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use civpds_store::block::links_of;
use civpds_store::{Block, BlockStore, CarWriter, StoreError, StoreResult};
use civpds_types::cbor::RAW;
use civpds_types::{Cid, Tid, Uid};

use crate::error::{CarStoreError, CarStoreResult};
use crate::meta::NewBlockRef;
use crate::store::CarStore;
use crate::view::ActorView;

/// Pending writes for one actor, layered over the actor's stored blocks.
///
/// Reads consult the session's own blocks first and then fall through to the
/// [`ActorView`]. Nothing reaches storage until
/// [`close_with_root`](Self::close_with_root).
pub struct DeltaSession {
    store: Arc<CarStore>,
    view: ActorView,
    actor: Uid,
    base: Option<Cid>,
    seq: i64,
    last_rev: Option<Tid>,
    readonly: bool,
    blocks: RwLock<HashMap<Cid, Bytes>>,
    removed: RwLock<HashSet<Cid>>,
}

impl DeltaSession {
    pub(crate) fn new(
        store: Arc<CarStore>,
        view: ActorView,
        base: Option<Cid>,
        seq: i64,
        last_rev: Option<Tid>,
        readonly: bool,
    ) -> Self {
        let actor = view.actor();
        Self {
            store,
            view,
            actor,
            base,
            seq,
            last_rev,
            readonly,
            blocks: RwLock::new(HashMap::new()),
            removed: RwLock::new(HashSet::new()),
        }
    }

    pub fn actor(&self) -> Uid {
        self.actor
    }

    /// Root of the actor's latest shard when the session was opened.
    pub fn base(&self) -> Option<Cid> {
        self.base
    }

    /// Sequence number the session's shard will be written under.
    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// Rev of the actor's latest shard when the session was opened.
    pub fn last_rev(&self) -> Option<&Tid> {
        self.last_rev.as_ref()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Blocks written in this session.
    pub fn pending(&self) -> Vec<Block> {
        self.blocks
            .read()
            .expect("lock poisoned")
            .iter()
            .map(|(cid, data)| Block::new(*cid, data.clone()))
            .collect()
    }

    /// CIDs deleted in this session. Shards are immutable, so removals are
    /// only tracked.
    pub fn removed(&self) -> Vec<Cid> {
        self.removed
            .read()
            .expect("lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    pub(crate) fn insert_verified(&self, blocks: Vec<Block>) {
        let mut map = self.blocks.write().expect("lock poisoned");
        for block in blocks {
            map.insert(block.cid, block.data);
        }
    }

    /// Blocks reachable from `root` through this session's own blocks, in
    /// breadth-first order with the root first.
    fn reachable_pending(&self, root: &Cid) -> CarStoreResult<Vec<(Cid, Bytes)>> {
        let blocks = self.blocks.read().expect("lock poisoned");
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([*root]);
        let mut out = Vec::new();
        while let Some(cid) = queue.pop_front() {
            if cid.codec() == RAW || !seen.insert(cid) {
                continue;
            }
            let Some(data) = blocks.get(&cid) else {
                continue;
            };
            for link in links_of(&cid, data)? {
                queue.push_back(link);
            }
            out.push((cid, data.clone()));
        }
        Ok(out)
    }

    /// Persist the root-reachable session blocks as a new shard and return
    /// the CAR bytes of the slice.
    ///
    /// `root` must have been written in this session and `rev` must advance
    /// past the actor's previous rev. The shard object is written first; the
    /// shard row and its block refs follow in one transaction.
    pub async fn close_with_root(&self, root: &Cid, rev: &Tid) -> CarStoreResult<Vec<u8>> {
        if self.readonly {
            return Err(CarStoreError::ReadOnly);
        }
        if let Some(prev) = &self.last_rev {
            if rev <= prev {
                return Err(CarStoreError::RevRegression {
                    prev: prev.clone(),
                    next: rev.clone(),
                });
            }
        }
        if !self.blocks.read().expect("lock poisoned").contains_key(root) {
            return Err(CarStoreError::MissingRoot(*root));
        }

        let reachable = self.reachable_pending(root)?;
        let mut writer = CarWriter::new(vec![*root])?;
        let mut refs = Vec::with_capacity(reachable.len());
        for (cid, data) in &reachable {
            let offset = writer.push(cid, data);
            refs.push(NewBlockRef {
                cid: *cid,
                byte_offset: offset as u64,
            });
        }
        let data_start = writer.data_start() as u64;
        let car = writer.finish();

        self.store
            .write_shard(self.actor, self.seq, rev, *root, &car, data_start, refs)
            .await?;
        Ok(car)
    }
}

#[async_trait]
impl BlockStore for DeltaSession {
    async fn get(&self, cid: &Cid) -> StoreResult<Bytes> {
        if let Some(data) = self.blocks.read().expect("lock poisoned").get(cid) {
            return Ok(data.clone());
        }
        self.view.get(cid).await
    }

    async fn has(&self, cid: &Cid) -> StoreResult<bool> {
        if self.blocks.read().expect("lock poisoned").contains_key(cid) {
            return Ok(true);
        }
        self.view.has(cid).await
    }

    async fn put(&self, block: Block) -> StoreResult<()> {
        if self.readonly {
            return Err(StoreError::ReadOnly);
        }
        self.blocks
            .write()
            .expect("lock poisoned")
            .insert(block.cid, block.data);
        Ok(())
    }

    async fn delete_block(&self, cid: &Cid) -> StoreResult<()> {
        if self.readonly {
            return Err(StoreError::ReadOnly);
        }
        self.blocks.write().expect("lock poisoned").remove(cid);
        self.removed.write().expect("lock poisoned").insert(*cid);
        Ok(())
    }

    async fn put_many(&self, blocks: Vec<Block>) -> StoreResult<()> {
        if self.readonly {
            return Err(StoreError::ReadOnly);
        }
        let mut map = self.blocks.write().expect("lock poisoned");
        for block in blocks {
            map.insert(block.cid, block.data);
        }
        Ok(())
    }
}
