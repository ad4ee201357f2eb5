//! Repository engine for the civic PDS.
//!
//! An actor's repository is a Merkle Search Tree of records keyed by
//! `<collection>/<rkey>`, rooted in a signed commit. The engine works
//! against any [`civpds_store::BlockStore`], in practice a carstore delta
//! session, and never holds private keys: commits are signed through a
//! [`civpds_crypto::CommitSigner`].
//!
//! # Key Types
//!
//! - [`Repo`] -- record CRUD, commit signing and diffs over one actor's tree
//! - [`mst::Tree`] -- the deterministic MST with lazy node loading
//! - [`SignedCommit`] / [`UnsignedCommit`] -- the repository root object
//! - [`RecordOp`] -- one create, update or delete between two commits
//!
//! # Invariants
//!
//! 1. The same key/value set always produces the same tree root CID.
//! 2. Every commit's rev is strictly greater than the previous one.
//! 3. Only version 3 commits are written; versions 2 and 3 are read.

pub mod commit;
pub mod error;
pub mod mst;
pub mod repo;

pub use commit::{SignedCommit, UnsignedCommit, COMMIT_VERSION};
pub use error::{RepoError, RepoResult};
pub use mst::{DiffOp, Tree, TreeChange};
pub use repo::{RecordOp, Repo};
