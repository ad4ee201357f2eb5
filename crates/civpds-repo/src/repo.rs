use std::sync::Arc;

use civpds_crypto::{CommitSigner, VerifyingKey};
use civpds_store::{Block, BlockStore};
use civpds_types::tid::global_clock;
use civpds_types::{cbor, Cid, Did, Ipld, RecordPath, Tid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::commit::{SignedCommit, UnsignedCommit};
use crate::error::{RepoError, RepoResult};
use crate::mst::{self, DiffOp, Tree, TreeChange};

/// One record-level change between two commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOp {
    pub action: DiffOp,
    /// `<collection>/<rkey>`.
    pub path: String,
    /// Record CID after the change; `None` for deletes.
    pub cid: Option<Cid>,
    /// Record CID before the change; `None` for creates.
    pub prev: Option<Cid>,
}

impl From<TreeChange> for RecordOp {
    fn from(change: TreeChange) -> Self {
        Self {
            action: change.op,
            path: change.key,
            cid: change.new,
            prev: change.old,
        }
    }
}

/// An actor's repository opened over a block store.
///
/// Mutations are staged in the in-memory tree until [`Repo::commit`] seals
/// the tree, signs a new commit and writes both to the store.
pub struct Repo {
    store: Arc<dyn BlockStore>,
    did: Did,
    head: Option<Cid>,
    commit: Option<SignedCommit>,
    tree: Tree,
}

impl Repo {
    /// Open the repository whose signed commit is stored at `root`.
    pub async fn open(store: Arc<dyn BlockStore>, root: &Cid) -> RepoResult<Self> {
        let commit = SignedCommit::load(store.as_ref(), root).await?;
        let tree = Tree::load(store.clone(), &commit.data()).await?;
        Ok(Self {
            store,
            did: commit.did().clone(),
            head: Some(*root),
            commit: Some(commit),
            tree,
        })
    }

    /// An empty repository for `did` with no commit yet.
    pub fn create(did: Did, store: Arc<dyn BlockStore>) -> Self {
        Self {
            tree: Tree::empty(store.clone()),
            store,
            did,
            head: None,
            commit: None,
        }
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    /// CID of the current signed commit.
    pub fn head(&self) -> Option<Cid> {
        self.head
    }

    pub fn signed_commit(&self) -> Option<&SignedCommit> {
        self.commit.as_ref()
    }

    /// Rev of the current commit.
    pub fn rev(&self) -> Option<&Tid> {
        self.commit.as_ref().and_then(|c| c.rev())
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    async fn put_record<T: Serialize>(&self, record: &T) -> RepoResult<Cid> {
        let block = Block::encode(&cbor::to_ipld(record)?)?;
        let cid = block.cid;
        self.store.put(block).await?;
        Ok(cid)
    }

    /// Store `record` and insert it at `<collection>/<rkey>`.
    pub async fn create_record<T: Serialize>(
        &mut self,
        collection: &str,
        rkey: &str,
        record: &T,
    ) -> RepoResult<Cid> {
        let path = RecordPath::new(collection, rkey)?;
        let cid = self.put_record(record).await?;
        self.tree.add(&path.key(), cid).await?;
        Ok(cid)
    }

    /// Replace the record at `<collection>/<rkey>`.
    pub async fn update_record<T: Serialize>(
        &mut self,
        collection: &str,
        rkey: &str,
        record: &T,
    ) -> RepoResult<Cid> {
        let path = RecordPath::new(collection, rkey)?;
        let cid = self.put_record(record).await?;
        self.tree.update(&path.key(), cid).await?;
        Ok(cid)
    }

    /// Remove the record at `path`, returning the CID it held.
    pub async fn delete_record(&mut self, path: &str) -> RepoResult<Cid> {
        let path = RecordPath::parse(path)?;
        self.tree.delete(&path.key()).await
    }

    /// Record CID and body at `path`.
    pub async fn get_record(&self, path: &str) -> RepoResult<(Cid, Ipld)> {
        let cid = self
            .tree
            .get(path)
            .await?
            .ok_or_else(|| RepoError::RecordNotFound(path.to_string()))?;
        let value = self.read_record(&cid).await?;
        Ok((cid, value))
    }

    /// Record at `path` decoded into `T`.
    pub async fn get_record_as<T: DeserializeOwned>(&self, path: &str) -> RepoResult<T> {
        let (_, value) = self.get_record(path).await?;
        Ok(cbor::from_ipld(value)?)
    }

    /// Decode the record block `cid`.
    pub async fn read_record(&self, cid: &Cid) -> RepoResult<Ipld> {
        let bytes = self.store.get(cid).await?;
        Ok(cbor::decode(&bytes)?)
    }

    /// Every record key and CID in `collection`, in key order.
    pub async fn list_records(&self, collection: &str) -> RepoResult<Vec<(String, Cid)>> {
        let prefix = format!("{collection}/");
        let mut out = Vec::new();
        self.tree
            .walk_leaves_from(&prefix, |key, cid| {
                if !key.starts_with(&prefix) {
                    return false;
                }
                out.push((key.to_string(), *cid));
                true
            })
            .await?;
        Ok(out)
    }

    /// Seal the tree, sign a new commit through `signer` and store it.
    ///
    /// The new rev is strictly greater than the current one even when the
    /// current rev was minted by a clock running ahead of ours.
    pub async fn commit(&mut self, signer: &dyn CommitSigner) -> RepoResult<(Cid, Tid)> {
        let data = self.tree.flush().await?;
        let rev = global_clock().next_after(self.rev());
        let unsigned = UnsignedCommit::new(self.did.clone(), data, rev.clone());
        let sig = signer.sign(&self.did, &unsigned.bytes_for_signing()?).await?;
        let commit = unsigned.sign(sig);
        let block = commit.to_block()?;
        let cid = block.cid;
        self.store.put(block).await?;
        debug!(did = %self.did, %rev, commit = %cid, "signed commit");

        self.head = Some(cid);
        self.commit = Some(commit);
        Ok((cid, rev))
    }

    /// Check the current commit's signature under `key`.
    pub fn verify(&self, key: &VerifyingKey) -> RepoResult<()> {
        self.commit.as_ref().ok_or(RepoError::NoCommit)?.verify(key)
    }

    /// Record changes from the commit at `old` to the current tree.
    ///
    /// `None` diffs against an empty repository.
    pub async fn diff_since(&self, old: Option<&Cid>) -> RepoResult<Vec<RecordOp>> {
        let old_tree = match old {
            Some(cid) => {
                let commit = SignedCommit::load(self.store.as_ref(), cid).await?;
                Tree::load(self.store.clone(), &commit.data()).await?
            }
            None => Tree::empty(self.store.clone()),
        };
        let changes = mst::diff(&old_tree, &self.tree).await?;
        Ok(changes.into_iter().map(RecordOp::from).collect())
    }
}
