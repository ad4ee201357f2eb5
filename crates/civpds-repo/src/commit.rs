//! Signed repository commits.
//!
//! A commit is the DAG-CBOR map `{did, version, prev, data, rev, sig}`. The
//! signature covers the same map without `sig`. Version 2 and 3 commits are
//! read; only version 3 is written, and it always carries `prev: null`.

use std::collections::BTreeMap;

use civpds_crypto::{Signature, VerifyingKey};
use civpds_store::{Block, BlockStore};
use civpds_types::cbor::{self, get_bytes, get_int, get_link, get_opt_link, get_opt_str, get_str};
use civpds_types::{Cid, Did, Ipld, Tid};

use crate::error::{RepoError, RepoResult};

/// Commit version emitted on write.
pub const COMMIT_VERSION: i64 = 3;

const WHAT: &str = "commit";

/// A commit before it is signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedCommit {
    pub did: Did,
    pub version: i64,
    pub prev: Option<Cid>,
    pub data: Cid,
    /// Absent only on legacy version 2 commits.
    pub rev: Option<Tid>,
}

impl UnsignedCommit {
    /// A version 3 commit over the tree rooted at `data`.
    pub fn new(did: Did, data: Cid, rev: Tid) -> Self {
        Self {
            did,
            version: COMMIT_VERSION,
            prev: None,
            data,
            rev: Some(rev),
        }
    }

    fn fields(&self) -> BTreeMap<String, Ipld> {
        let mut map = BTreeMap::new();
        map.insert("did".into(), Ipld::String(self.did.as_str().to_string()));
        map.insert("version".into(), Ipld::Integer(self.version.into()));
        map.insert("prev".into(), cbor::opt_link(self.prev));
        map.insert("data".into(), Ipld::Link(self.data));
        if let Some(rev) = &self.rev {
            map.insert("rev".into(), Ipld::String(rev.as_str().to_string()));
        }
        map
    }

    /// DAG-CBOR bytes the signature is computed over.
    pub fn bytes_for_signing(&self) -> RepoResult<Vec<u8>> {
        Ok(cbor::encode(&Ipld::Map(self.fields()))?)
    }

    /// Attach a signature.
    pub fn sign(self, sig: Signature) -> SignedCommit {
        SignedCommit {
            unsigned: self,
            sig,
        }
    }
}

/// A commit with its signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCommit {
    unsigned: UnsignedCommit,
    sig: Signature,
}

impl SignedCommit {
    pub fn did(&self) -> &Did {
        &self.unsigned.did
    }

    pub fn version(&self) -> i64 {
        self.unsigned.version
    }

    pub fn prev(&self) -> Option<Cid> {
        self.unsigned.prev
    }

    /// Root of the record tree.
    pub fn data(&self) -> Cid {
        self.unsigned.data
    }

    pub fn rev(&self) -> Option<&Tid> {
        self.unsigned.rev.as_ref()
    }

    pub fn sig(&self) -> &Signature {
        &self.sig
    }

    pub fn unsigned(&self) -> &UnsignedCommit {
        &self.unsigned
    }

    pub fn to_ipld(&self) -> Ipld {
        let mut map = self.unsigned.fields();
        map.insert("sig".into(), Ipld::Bytes(self.sig.to_vec()));
        Ipld::Map(map)
    }

    /// Encode as a block.
    pub fn to_block(&self) -> RepoResult<Block> {
        Ok(Block::encode(&self.to_ipld())?)
    }

    /// Decode a commit, rejecting versions other than 2 and 3.
    pub fn decode(bytes: &[u8]) -> RepoResult<Self> {
        let value = cbor::decode(bytes)?;
        let map = cbor::as_map(&value, WHAT)?;

        let version = get_int(map, "version", WHAT)?;
        if version != 2 && version != 3 {
            return Err(RepoError::UnsupportedVersion(version));
        }
        let did = Did::parse(get_str(map, "did", WHAT)?)?;
        let data = get_link(map, "data", WHAT)?;
        let prev = get_opt_link(map, "prev", WHAT)?;
        let rev = get_opt_str(map, "rev", WHAT)?.map(Tid::parse).transpose()?;
        if version == 3 && rev.is_none() {
            return Err(RepoError::MalformedNode("version 3 commit without rev".into()));
        }
        let sig = Signature::from_compact(get_bytes(map, "sig", WHAT)?)?;

        Ok(Self {
            unsigned: UnsignedCommit {
                did,
                version,
                prev,
                data,
                rev,
            },
            sig,
        })
    }

    /// Load the commit stored under `cid`.
    pub async fn load(store: &dyn BlockStore, cid: &Cid) -> RepoResult<Self> {
        let bytes = store.get(cid).await?;
        Self::decode(&bytes)
    }

    /// Check the signature under `key`.
    pub fn verify(&self, key: &VerifyingKey) -> RepoResult<()> {
        let bytes = self.unsigned.bytes_for_signing()?;
        key.verify(&bytes, &self.sig)
            .map_err(|_| RepoError::BadSignature(self.unsigned.did.to_string()))
    }
}
