use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use civpds_store::car::{read_car, CarReader};
use civpds_store::{collect_reachable, CarWriter, MemBlockStore, ObjectStorage, CAR_CONTENT_TYPE};
use civpds_types::{Cid, Tid, Uid};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{CarStoreError, CarStoreResult};
use crate::meta::{NewBlockRef, NewShard, Shard, ShardIndex};
use crate::session::DeltaSession;
use crate::view::ActorView;

/// Tuning for actor reads.
#[derive(Debug, Clone)]
pub struct CarStoreConfig {
    /// Fetch whole shards on a cache miss when they are small enough.
    pub prefetch: bool,
    /// Largest shard, in bytes, fetched whole.
    pub prefetch_limit: u64,
}

impl Default for CarStoreConfig {
    fn default() -> Self {
        Self {
            prefetch: true,
            prefetch_limit: 512 * 1024,
        }
    }
}

/// Outcome of compacting one actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub actor: Uid,
    pub shards_before: usize,
    pub blocks_kept: usize,
    pub bytes_written: usize,
}

/// Object key of a commit shard.
pub fn shard_path(actor: Uid, seq: i64) -> String {
    format!("sh-{actor}/seq-{seq}")
}

fn actor_prefix(actor: Uid) -> String {
    format!("sh-{actor}/")
}

/// Sharded block store over object storage and a SQLite index.
pub struct CarStore {
    index: ShardIndex,
    objects: Arc<dyn ObjectStorage>,
    last_shards: Mutex<HashMap<Uid, Shard>>,
    config: CarStoreConfig,
}

impl CarStore {
    pub fn new(
        index: ShardIndex,
        objects: Arc<dyn ObjectStorage>,
        config: CarStoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            objects,
            last_shards: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn index(&self) -> &ShardIndex {
        &self.index
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStorage> {
        &self.objects
    }

    /// Liveness check against the index database.
    pub async fn ping(&self) -> CarStoreResult<()> {
        self.index.ping().await
    }

    /// Latest shard of `actor`, served from the last-shard cache when possible.
    pub async fn last_shard(&self, actor: Uid) -> CarStoreResult<Option<Shard>> {
        if let Some(shard) = self.last_shards.lock().expect("lock poisoned").get(&actor) {
            return Ok(Some(shard.clone()));
        }
        let shard = self.index.last_shard(actor).await?;
        if let Some(shard) = &shard {
            self.cache_shard(shard.clone());
        }
        Ok(shard)
    }

    fn cache_shard(&self, shard: Shard) {
        let mut cache = self.last_shards.lock().expect("lock poisoned");
        match cache.get(&shard.actor) {
            Some(current) if current.seq > shard.seq => {}
            _ => {
                cache.insert(shard.actor, shard);
            }
        }
    }

    fn evict(&self, actor: Uid) {
        self.last_shards.lock().expect("lock poisoned").remove(&actor);
    }

    /// A read-through view of the actor's stored blocks.
    pub fn actor_view(&self, actor: Uid) -> ActorView {
        ActorView::new(
            self.index.clone(),
            self.objects.clone(),
            actor,
            self.config.prefetch,
            self.config.prefetch_limit,
        )
    }

    /// Open a writable session on the actor's latest shard.
    ///
    /// When `since` is given it must equal the current rev, otherwise the
    /// write is stale and refused.
    pub async fn new_delta_session(
        self: &Arc<Self>,
        actor: Uid,
        since: Option<&Tid>,
    ) -> CarStoreResult<DeltaSession> {
        let last = self.last_shard(actor).await?;
        let current = last.as_ref().map(|s| s.rev.clone());
        if let Some(since) = since {
            if current.as_ref() != Some(since) {
                return Err(CarStoreError::StaleRev {
                    actor,
                    expected: Some(since.clone()),
                    current,
                });
            }
        }
        let (base, seq) = match &last {
            Some(shard) => (Some(shard.root), shard.seq + 1),
            None => (None, 1),
        };
        Ok(DeltaSession::new(
            self.clone(),
            self.actor_view(actor),
            base,
            seq,
            current,
            false,
        ))
    }

    /// Open a session that rejects writes.
    pub async fn read_only_session(self: &Arc<Self>, actor: Uid) -> CarStoreResult<DeltaSession> {
        let last = self.last_shard(actor).await?;
        let (base, seq, rev) = match last {
            Some(shard) => (Some(shard.root), shard.seq, Some(shard.rev)),
            None => (None, 0, None),
        };
        Ok(DeltaSession::new(
            self.clone(),
            self.actor_view(actor),
            base,
            seq,
            rev,
            true,
        ))
    }

    /// Root CID of the actor's latest commit.
    pub async fn get_actor_repo_head(&self, actor: Uid) -> CarStoreResult<Cid> {
        self.last_shard(actor)
            .await?
            .map(|s| s.root)
            .ok_or(CarStoreError::NoRepo(actor))
    }

    /// Rev of the actor's latest commit.
    pub async fn get_actor_repo_rev(&self, actor: Uid) -> CarStoreResult<Tid> {
        self.last_shard(actor)
            .await?
            .map(|s| s.rev)
            .ok_or(CarStoreError::NoRepo(actor))
    }

    /// Stream every shard with `rev >= since`, oldest first, under one CAR
    /// header rooted at the current head.
    pub async fn read_actor_car<W>(
        &self,
        actor: Uid,
        since: Option<&Tid>,
        out: &mut W,
    ) -> CarStoreResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let head = self.get_actor_repo_head(actor).await?;
        let shards = self.index.shards_since(actor, since.cloned()).await?;
        let header = CarWriter::new(vec![head])?.finish();
        out.write_all(&header)
            .await
            .map_err(civpds_store::StoreError::from)?;
        for shard in shards {
            let bytes = self.objects.get(&shard.path).await?;
            let start = shard.data_start as usize;
            if start > bytes.len() {
                return Err(CarStoreError::Corrupt {
                    path: shard.path,
                    reason: format!("data_start {start} past end {}", bytes.len()),
                });
            }
            out.write_all(&bytes[start..])
                .await
                .map_err(civpds_store::StoreError::from)?;
        }
        out.flush().await.map_err(civpds_store::StoreError::from)?;
        Ok(())
    }

    /// Load an externally produced CAR slice into a new delta session.
    ///
    /// Every block is verified against its CID. Returns the slice's root and
    /// the session holding its blocks.
    pub async fn import_slice(
        self: &Arc<Self>,
        actor: Uid,
        since: Option<&Tid>,
        bytes: &[u8],
    ) -> CarStoreResult<(Cid, DeltaSession)> {
        let reader = CarReader::new(bytes)?;
        let root = reader
            .header()
            .root()
            .ok_or_else(|| civpds_store::StoreError::InvalidCar("no root".into()))?;
        let blocks = reader.blocks()?;
        let session = self.new_delta_session(actor, since).await?;
        session.insert_verified(blocks);
        Ok((root, session))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn write_shard(
        &self,
        actor: Uid,
        seq: i64,
        rev: &Tid,
        root: Cid,
        car: &[u8],
        data_start: u64,
        refs: Vec<NewBlockRef>,
    ) -> CarStoreResult<Shard> {
        let path = shard_path(actor, seq);
        self.objects
            .put(&path, Bytes::copy_from_slice(car), CAR_CONTENT_TYPE)
            .await?;
        let blocks = refs.len();
        let shard = self
            .index
            .put_shard_and_refs(
                NewShard {
                    actor,
                    seq,
                    rev: rev.clone(),
                    root,
                    path,
                    data_start,
                },
                refs,
            )
            .await?;
        debug!(%actor, seq, %rev, shard = %shard.path, blocks, bytes = car.len(), "wrote shard");
        self.cache_shard(shard.clone());
        Ok(shard)
    }

    /// Rewrite all of the actor's shards into one when it holds more than
    /// `min_shards`. Returns `None` when nothing was done.
    ///
    /// Callers must hold the actor's write lock.
    pub async fn compact_actor(
        &self,
        actor: Uid,
        min_shards: i64,
    ) -> CarStoreResult<Option<CompactionReport>> {
        let shards = self.index.shards_since(actor, None).await?;
        if shards.len() as i64 <= min_shards {
            return Ok(None);
        }
        let Some(head) = shards.last().cloned() else {
            return Ok(None);
        };

        let mut blocks = Vec::new();
        for shard in &shards {
            let bytes = self.objects.get(&shard.path).await?;
            blocks.extend(read_car(&bytes)?.1);
        }
        let all = MemBlockStore::from_blocks(blocks);
        let kept = collect_reachable(&all, &head.root, false).await?;

        let mut writer = CarWriter::new(vec![head.root])?;
        let mut refs = Vec::with_capacity(kept.len());
        for block in &kept {
            let offset = writer.push(&block.cid, &block.data);
            refs.push(NewBlockRef {
                cid: block.cid,
                byte_offset: offset as u64,
            });
        }
        let data_start = writer.data_start() as u64;
        let car = writer.finish();
        let path = format!("{}compact-{}", actor_prefix(actor), head.rev);
        self.objects
            .put(&path, Bytes::copy_from_slice(&car), CAR_CONTENT_TYPE)
            .await?;

        let (shard, old_paths) = self
            .index
            .replace_actor_shards(
                NewShard {
                    actor,
                    seq: 1,
                    rev: head.rev.clone(),
                    root: head.root,
                    path: path.clone(),
                    data_start,
                },
                refs,
            )
            .await?;
        self.evict(actor);
        self.cache_shard(shard);

        for old in old_paths.iter().filter(|p| **p != path) {
            if let Err(e) = self.objects.delete(old).await {
                warn!(%actor, shard = %old, error = %e, "failed to delete compacted shard");
            }
        }

        let report = CompactionReport {
            actor,
            shards_before: shards.len(),
            blocks_kept: kept.len(),
            bytes_written: car.len(),
        };
        info!(
            %actor,
            shards = report.shards_before,
            blocks = report.blocks_kept,
            bytes = report.bytes_written,
            "compacted actor"
        );
        Ok(Some(report))
    }

    /// Compact every actor holding more than `min_shards` shards.
    pub async fn compact_all(&self, min_shards: i64) -> CarStoreResult<Vec<CompactionReport>> {
        let mut reports = Vec::new();
        for actor in self.index.actors_over(min_shards).await? {
            if let Some(report) = self.compact_actor(actor, min_shards).await? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Delete every shard, block ref and shard object of `actor`.
    pub async fn wipe_actor_data(&self, actor: Uid) -> CarStoreResult<()> {
        let paths = self.index.delete_actor(actor).await?;
        self.evict(actor);
        for path in &paths {
            if let Err(e) = self.objects.delete(path).await {
                warn!(%actor, shard = %path, error = %e, "failed to delete shard object");
            }
        }
        info!(%actor, shards = paths.len(), "wiped actor data");
        Ok(())
    }

    /// Delete shard objects under the actor's prefix that no shard row
    /// references. Returns the number removed.
    pub async fn sweep_orphans(&self, actor: Uid) -> CarStoreResult<usize> {
        let live: HashSet<String> = self
            .index
            .shards_since(actor, None)
            .await?
            .into_iter()
            .map(|s| s.path)
            .collect();
        let mut removed = 0;
        for key in self.objects.list(&actor_prefix(actor)).await? {
            if !live.contains(&key) {
                self.objects.delete(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(%actor, removed, "swept orphaned shard objects");
        }
        Ok(removed)
    }
}
