use std::sync::Arc;

use civpds_carstore::{CarStore, CarStoreError, CompactionReport, DeltaSession};
use civpds_crypto::{
    CommitSigner, DirectoryClient, DirectoryOp, KeyManager, PlcOperation, PlcTombstone,
    SigningKeyResolver,
};
use civpds_repo::{RecordOp, Repo};
use civpds_store::car::read_car;
use civpds_store::{collect_reachable, BlockStore, MemBlockStore, StoreError};
use civpds_types::tid::global_clock;
use civpds_types::{cbor, next_tid, Cid, Did, Ipld, RecordPath, Tid, Uid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::actor::ActorDirectory;
use crate::error::{RepoMgrError, RepoMgrResult};
use crate::events::{AccountStatus, RepoEvent, RepoEventHandler, RepoEventOp};
use crate::lock::ActorLocks;

/// Repo manager settings.
#[derive(Debug, Clone)]
pub struct RepoManagerConfig {
    /// Collection the profile record is written to by `init_new_repo`.
    pub profile_collection: String,
    /// Decode record bodies for events applied from other hosts.
    pub hydrate_external: bool,
}

impl Default for RepoManagerConfig {
    fn default() -> Self {
        Self {
            profile_collection: "com.example.profile".to_string(),
            hydrate_external: true,
        }
    }
}

/// One write in a batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// A `None` rkey is replaced by a fresh TID.
    Create {
        collection: String,
        rkey: Option<String>,
        record: Ipld,
    },
    Update {
        collection: String,
        rkey: String,
        record: Ipld,
    },
    Delete {
        collection: String,
        rkey: String,
    },
}

impl WriteOp {
    pub fn create<T: Serialize>(
        collection: impl Into<String>,
        rkey: Option<String>,
        record: &T,
    ) -> RepoMgrResult<Self> {
        Ok(Self::Create {
            collection: collection.into(),
            rkey,
            record: cbor::to_ipld(record)?,
        })
    }

    pub fn update<T: Serialize>(
        collection: impl Into<String>,
        rkey: impl Into<String>,
        record: &T,
    ) -> RepoMgrResult<Self> {
        Ok(Self::Update {
            collection: collection.into(),
            rkey: rkey.into(),
            record: cbor::to_ipld(record)?,
        })
    }

    pub fn delete(collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self::Delete {
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }
}

/// Outcome of one write in a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub path: String,
    /// Record CID written; `None` for deletes.
    pub cid: Option<Cid>,
}

/// A commit produced by the repo manager.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub head: Cid,
    pub rev: Tid,
    pub since: Option<Tid>,
    pub writes: Vec<WriteResult>,
}

/// Glue between the CAR store, repository engine, key manager and event
/// stream.
///
/// Every mutation of an actor's repository runs under that actor's lock:
/// read the current rev, open a delta session at it, apply the change,
/// sign, close the session into a new shard and emit the event. Work on
/// different actors proceeds in parallel.
pub struct RepoManager {
    cs: Arc<CarStore>,
    signer: Arc<dyn CommitSigner>,
    resolver: Arc<dyn SigningKeyResolver>,
    directory: Arc<dyn ActorDirectory>,
    handler: Arc<dyn RepoEventHandler>,
    accounts: Option<(Arc<KeyManager>, Arc<dyn DirectoryClient>)>,
    locks: ActorLocks,
    config: RepoManagerConfig,
}

fn no_repo(e: CarStoreError) -> RepoMgrError {
    match e {
        CarStoreError::NoRepo(actor) => RepoMgrError::NoRepo(actor),
        other => other.into(),
    }
}

impl RepoManager {
    pub fn new(
        cs: Arc<CarStore>,
        signer: Arc<dyn CommitSigner>,
        resolver: Arc<dyn SigningKeyResolver>,
        directory: Arc<dyn ActorDirectory>,
        handler: Arc<dyn RepoEventHandler>,
        config: RepoManagerConfig,
    ) -> Self {
        Self {
            cs,
            signer,
            resolver,
            directory,
            handler,
            accounts: None,
            locks: ActorLocks::new(),
            config,
        }
    }

    /// Enable account creation and deletion.
    pub fn with_accounts(mut self, keys: Arc<KeyManager>, plc: Arc<dyn DirectoryClient>) -> Self {
        self.accounts = Some((keys, plc));
        self
    }

    pub fn carstore(&self) -> &Arc<CarStore> {
        &self.cs
    }

    pub fn directory(&self) -> &Arc<dyn ActorDirectory> {
        &self.directory
    }

    pub fn config(&self) -> &RepoManagerConfig {
        &self.config
    }

    async fn writable_did(&self, actor: Uid) -> RepoMgrResult<Did> {
        let record = self
            .directory
            .get(actor)
            .await?
            .ok_or(RepoMgrError::UnknownActor(actor))?;
        if record.taken_down {
            return Err(RepoMgrError::TakenDown(actor));
        }
        Ok(record.did)
    }

    async fn ensure_not_taken_down(&self, actor: Uid) -> RepoMgrResult<()> {
        match self.directory.get(actor).await? {
            Some(record) if record.taken_down => Err(RepoMgrError::TakenDown(actor)),
            _ => Ok(()),
        }
    }

    async fn hydrate(&self, repo: &Repo, ops: Vec<RecordOp>, hydrate: bool) -> RepoMgrResult<Vec<RepoEventOp>> {
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            let record = match op.cid {
                Some(cid) if hydrate => match repo.read_record(&cid).await {
                    Ok(value) => Some(value),
                    Err(e) if e.is_missing_block() => None,
                    Err(e) => return Err(e.into()),
                },
                _ => None,
            };
            out.push(RepoEventOp {
                action: op.action,
                path: op.path,
                cid: op.cid,
                record,
            });
        }
        Ok(out)
    }

    // ---- Local writes ----

    /// Create the actor's repository with a profile record at
    /// `<profile_collection>/self`.
    pub async fn init_new_repo<T: Serialize>(
        &self,
        actor: Uid,
        did: &Did,
        profile: &T,
    ) -> RepoMgrResult<CommitInfo> {
        let _guard = self.locks.lock(actor).await;
        if self.cs.last_shard(actor).await?.is_some() {
            return Err(RepoMgrError::RepoExists(actor));
        }
        self.directory.register(actor, did.clone()).await?;

        let session = Arc::new(self.cs.new_delta_session(actor, None).await?);
        let mut repo = Repo::create(did.clone(), session.clone());
        let cid = repo
            .create_record(&self.config.profile_collection, "self", profile)
            .await?;
        let path = RecordPath::new(self.config.profile_collection.as_str(), "self")?.key();
        let writes = vec![WriteResult {
            path,
            cid: Some(cid),
        }];
        let info = self
            .seal(actor, &session, &mut repo, None, None, writes)
            .await?;
        info!(%actor, %did, rev = %info.rev, "initialized repo");
        Ok(info)
    }

    /// Apply `writes` to the actor's repository as a single commit.
    pub async fn batch_write(&self, actor: Uid, writes: Vec<WriteOp>) -> RepoMgrResult<CommitInfo> {
        let did = self.writable_did(actor).await?;
        let _guard = self.locks.lock(actor).await;

        let rev = self.cs.get_actor_repo_rev(actor).await.map_err(no_repo)?;
        let session = Arc::new(self.cs.new_delta_session(actor, Some(&rev)).await?);
        let base = session.base().ok_or(RepoMgrError::NoRepo(actor))?;
        let mut repo = Repo::open(session.clone(), &base).await?;
        if repo.did() != &did {
            return Err(RepoMgrError::DidMismatch {
                expected: did,
                found: repo.did().clone(),
            });
        }

        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            results.push(match write {
                WriteOp::Create {
                    collection,
                    rkey,
                    record,
                } => {
                    let rkey = rkey.unwrap_or_else(|| next_tid().as_str().to_string());
                    let cid = repo.create_record(&collection, &rkey, &record).await?;
                    WriteResult {
                        path: RecordPath::new(collection, rkey)?.key(),
                        cid: Some(cid),
                    }
                }
                WriteOp::Update {
                    collection,
                    rkey,
                    record,
                } => {
                    let cid = repo.update_record(&collection, &rkey, &record).await?;
                    WriteResult {
                        path: RecordPath::new(collection, rkey)?.key(),
                        cid: Some(cid),
                    }
                }
                WriteOp::Delete { collection, rkey } => {
                    let path = RecordPath::new(collection, rkey)?.key();
                    repo.delete_record(&path).await?;
                    WriteResult { path, cid: None }
                }
            });
        }

        self.seal(actor, &session, &mut repo, Some(base), Some(rev), results)
            .await
    }

    /// Create a record; a `None` rkey gets a fresh TID.
    pub async fn create_record<T: Serialize>(
        &self,
        actor: Uid,
        collection: &str,
        rkey: Option<&str>,
        record: &T,
    ) -> RepoMgrResult<CommitInfo> {
        let op = WriteOp::create(collection, rkey.map(str::to_string), record)?;
        self.batch_write(actor, vec![op]).await
    }

    pub async fn update_record<T: Serialize>(
        &self,
        actor: Uid,
        collection: &str,
        rkey: &str,
        record: &T,
    ) -> RepoMgrResult<CommitInfo> {
        self.batch_write(actor, vec![WriteOp::update(collection, rkey, record)?])
            .await
    }

    pub async fn delete_record(
        &self,
        actor: Uid,
        collection: &str,
        rkey: &str,
    ) -> RepoMgrResult<CommitInfo> {
        self.batch_write(actor, vec![WriteOp::delete(collection, rkey)])
            .await
    }

    /// Sign the staged tree, persist the session as a shard and emit.
    async fn seal(
        &self,
        actor: Uid,
        session: &Arc<DeltaSession>,
        repo: &mut Repo,
        base: Option<Cid>,
        since: Option<Tid>,
        writes: Vec<WriteResult>,
    ) -> RepoMgrResult<CommitInfo> {
        let (head, rev) = repo.commit(self.signer.as_ref()).await?;
        let ops = repo.diff_since(base.as_ref()).await?;
        let slice = session.close_with_root(&head, &rev).await?;
        let ops = self.hydrate(repo, ops, true).await?;
        debug!(%actor, %rev, commit = %head, ops = ops.len(), "committed local write");

        self.handler
            .handle_repo_event(RepoEvent {
                actor,
                did: repo.did().clone(),
                old: base,
                new: head,
                rev: rev.clone(),
                since: since.clone(),
                ops,
                repo_slice: slice,
                pds: None,
            })
            .await;
        Ok(CommitInfo {
            head,
            rev,
            since,
            writes,
        })
    }

    // ---- Reads ----

    async fn open_read_only(&self, actor: Uid) -> RepoMgrResult<Repo> {
        let session = Arc::new(self.cs.read_only_session(actor).await?);
        let base = session.base().ok_or(RepoMgrError::NoRepo(actor))?;
        Ok(Repo::open(session, &base).await?)
    }

    /// Record CID and body at `<collection>/<rkey>`.
    pub async fn get_record(&self, actor: Uid, path: &str) -> RepoMgrResult<(Cid, Ipld)> {
        let repo = self.open_read_only(actor).await?;
        Ok(repo.get_record(path).await?)
    }

    pub async fn get_record_as<T: DeserializeOwned>(&self, actor: Uid, path: &str) -> RepoMgrResult<T> {
        let repo = self.open_read_only(actor).await?;
        Ok(repo.get_record_as(path).await?)
    }

    /// Keys and CIDs of every record in `collection`.
    pub async fn list_records(
        &self,
        actor: Uid,
        collection: &str,
    ) -> RepoMgrResult<Vec<(String, Cid)>> {
        let repo = self.open_read_only(actor).await?;
        Ok(repo.list_records(collection).await?)
    }

    pub async fn get_actor_repo_head(&self, actor: Uid) -> RepoMgrResult<Cid> {
        self.cs.get_actor_repo_head(actor).await.map_err(no_repo)
    }

    pub async fn get_actor_repo_rev(&self, actor: Uid) -> RepoMgrResult<Tid> {
        self.cs.get_actor_repo_rev(actor).await.map_err(no_repo)
    }

    /// Write the actor's repository as a CAR, limited to shards at or after
    /// `since`.
    pub async fn read_repo<W>(&self, actor: Uid, since: Option<&Tid>, out: &mut W) -> RepoMgrResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.cs
            .read_actor_car(actor, since, out)
            .await
            .map_err(no_repo)
    }

    // ---- External data ----

    /// Apply a commit received from another host.
    ///
    /// The slice is imported against `since`, its commit is checked against
    /// `did`'s signing key, and the resulting diff is emitted tagged with
    /// `pds`. Nothing is persisted when verification fails.
    pub async fn handle_external_actor_event(
        &self,
        pds: u64,
        actor: Uid,
        did: &Did,
        since: Option<&Tid>,
        nrev: &Tid,
        car_slice: &[u8],
    ) -> RepoMgrResult<CommitInfo> {
        self.ensure_not_taken_down(actor).await?;
        let _guard = self.locks.lock(actor).await;

        let (root, session) = self.cs.import_slice(actor, since, car_slice).await?;
        let session = Arc::new(session);
        let base = session.base();
        let repo = Repo::open(session.clone(), &root).await?;
        if repo.did() != did {
            return Err(RepoMgrError::DidMismatch {
                expected: did.clone(),
                found: repo.did().clone(),
            });
        }
        let key = self.resolver.resolve(did).await?;
        repo.verify(&key)?;

        let rev = match repo.rev() {
            Some(rev) => {
                if rev != nrev {
                    warn!(%actor, %did, event_rev = %nrev, commit_rev = %rev, "event rev differs from commit");
                }
                rev.clone()
            }
            None => nrev.clone(),
        };
        let ops = repo.diff_since(base.as_ref()).await?;
        let slice = session.close_with_root(&root, &rev).await?;
        let ops = self.hydrate(&repo, ops, self.config.hydrate_external).await?;
        debug!(%actor, %did, pds, %rev, ops = ops.len(), "applied external commit");

        let writes = ops
            .iter()
            .map(|op| WriteResult {
                path: op.path.clone(),
                cid: op.cid,
            })
            .collect();
        self.handler
            .handle_repo_event(RepoEvent {
                actor,
                did: did.clone(),
                old: base,
                new: root,
                rev: rev.clone(),
                since: since.cloned(),
                ops,
                repo_slice: slice,
                pds: Some(pds),
            })
            .await;
        Ok(CommitInfo {
            head: root,
            rev,
            since: since.cloned(),
            writes,
        })
    }

    /// Import a repository CAR fetched from another host.
    ///
    /// `rev` is the local rev the CAR was requested since; `None` marks a
    /// full sync, which diffs against an empty repo regardless of the
    /// current head. Returns `None` when the CAR's root is already the head.
    pub async fn import_new_repo(
        &self,
        actor: Uid,
        did: &Did,
        car: &[u8],
        rev: Option<&Tid>,
    ) -> RepoMgrResult<Option<CommitInfo>> {
        self.ensure_not_taken_down(actor).await?;
        let _guard = self.locks.lock(actor).await;

        let (header, blocks) = read_car(car)?;
        let root = header
            .root()
            .ok_or_else(|| StoreError::InvalidCar("no root".into()))?;
        let current = self.cs.last_shard(actor).await?;
        if current.as_ref().map(|s| s.root) == Some(root) {
            debug!(%actor, %did, head = %root, "import is already the head");
            return Ok(None);
        }

        let staged = MemBlockStore::from_blocks(blocks);
        let reachable = collect_reachable(&staged, &root, rev.is_some()).await?;
        let session = Arc::new(self.cs.new_delta_session(actor, rev).await?);
        let mut copied = 0usize;
        for block in reachable {
            // the root is always rewritten so the new shard can be rooted at it
            if block.cid == root || !session.has(&block.cid).await? {
                session.put(block).await?;
                copied += 1;
            }
        }

        let repo = Repo::open(session.clone(), &root).await?;
        if repo.did() != did {
            return Err(RepoMgrError::DidMismatch {
                expected: did.clone(),
                found: repo.did().clone(),
            });
        }
        let key = self.resolver.resolve(did).await?;
        repo.verify(&key)?;
        self.directory.register(actor, did.clone()).await?;

        let nrev = match repo.rev() {
            Some(r) => r.clone(),
            None => global_clock().next_after(session.last_rev()),
        };
        let base = match rev {
            Some(_) => session.base(),
            None => None,
        };
        let ops = repo.diff_since(base.as_ref()).await?;
        let slice = session.close_with_root(&root, &nrev).await?;
        let ops = self.hydrate(&repo, ops, true).await?;
        info!(%actor, %did, rev = %nrev, blocks = copied, ops = ops.len(), "imported repo");

        let writes = ops
            .iter()
            .map(|op| WriteResult {
                path: op.path.clone(),
                cid: op.cid,
            })
            .collect();
        self.handler
            .handle_repo_event(RepoEvent {
                actor,
                did: did.clone(),
                old: base,
                new: root,
                rev: nrev.clone(),
                since: rev.cloned(),
                ops,
                repo_slice: slice,
                pds: None,
            })
            .await;
        Ok(Some(CommitInfo {
            head: root,
            rev: nrev,
            since: rev.cloned(),
            writes,
        }))
    }

    // ---- Accounts ----

    /// Mint a signing key and directory identity for a new local actor and
    /// initialize its repository. Returns the new DID.
    pub async fn create_account<T: Serialize>(
        &self,
        actor: Uid,
        handle: &str,
        pds_endpoint: &str,
        profile: &T,
    ) -> RepoMgrResult<Did> {
        let (keys, plc) = self.accounts.as_ref().ok_or(RepoMgrError::NoAccounts)?;
        let key = KeyManager::create_signing_key();
        let rotation = keys.directory_did_key().await?;
        let op = PlcOperation::genesis(handle, pds_endpoint, &key.did_key(), vec![rotation]);
        let sig = keys.sign_for_directory(&op.unsigned_bytes()?).await?;
        let op = op.with_signature(&sig);
        let did = op.did()?;

        keys.create_encrypted_key(&did, key).await?;
        plc.submit(&did, DirectoryOp::Operation(op)).await?;
        self.init_new_repo(actor, &did, profile).await?;
        self.handler
            .handle_account_status(actor, &did, AccountStatus::Active)
            .await;
        Ok(did)
    }

    /// Refuse further writes for `actor` and announce it.
    pub async fn take_down(&self, actor: Uid) -> RepoMgrResult<()> {
        self.set_taken_down(actor, true).await
    }

    /// Lift a takedown.
    pub async fn reinstate(&self, actor: Uid) -> RepoMgrResult<()> {
        self.set_taken_down(actor, false).await
    }

    async fn set_taken_down(&self, actor: Uid, taken_down: bool) -> RepoMgrResult<()> {
        let record = self
            .directory
            .get(actor)
            .await?
            .ok_or(RepoMgrError::UnknownActor(actor))?;
        let _guard = self.locks.lock(actor).await;
        self.directory.set_taken_down(actor, taken_down).await?;
        let status = if taken_down {
            AccountStatus::TakenDown
        } else {
            AccountStatus::Active
        };
        info!(%actor, did = %record.did, ?status, "account status changed");
        self.handler
            .handle_account_status(actor, &record.did, status)
            .await;
        Ok(())
    }

    /// Remove every shard and key of `actor` and tombstone its directory
    /// entry. `plc_prev` is the CID of the actor's latest directory
    /// operation.
    pub async fn delete_account(&self, actor: Uid, plc_prev: &str) -> RepoMgrResult<()> {
        let (keys, plc) = self.accounts.as_ref().ok_or(RepoMgrError::NoAccounts)?;
        let record = self
            .directory
            .get(actor)
            .await?
            .ok_or(RepoMgrError::UnknownActor(actor))?;
        let _guard = self.locks.lock(actor).await;

        self.cs.wipe_actor_data(actor).await?;
        keys.delete_key(&record.did).await?;
        let tombstone = PlcTombstone::new(plc_prev);
        let sig = keys.sign_for_directory(&tombstone.unsigned_bytes()?).await?;
        plc.submit(&record.did, DirectoryOp::Tombstone(tombstone.with_signature(&sig)))
            .await?;
        self.directory.remove(actor).await?;
        info!(%actor, did = %record.did, "deleted account");
        self.handler
            .handle_account_status(actor, &record.did, AccountStatus::Deleted)
            .await;
        Ok(())
    }

    // ---- Maintenance ----

    /// Compact the actor's shards when it has more than `min_shards`.
    pub async fn compact(&self, actor: Uid, min_shards: i64) -> RepoMgrResult<Option<CompactionReport>> {
        let _guard = self.locks.lock(actor).await;
        Ok(self.cs.compact_actor(actor, min_shards).await?)
    }

    /// Compact every actor over `min_shards`, one at a time.
    pub async fn compact_all(&self, min_shards: i64) -> RepoMgrResult<Vec<CompactionReport>> {
        let mut reports = Vec::new();
        for actor in self.cs.index().actors_over(min_shards).await? {
            if let Some(report) = self.compact(actor, min_shards).await? {
                reports.push(report);
            }
        }
        Ok(reports)
    }
}
