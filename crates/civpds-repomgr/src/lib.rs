//! Repo manager for civpds.
//!
//! Ties the sharded CAR store, the repository engine and the key manager
//! together: local record writes, commits applied from other hosts, and
//! full repository imports all end as one new shard and one emitted
//! [`RepoEvent`].
//!
//! # Key Types
//!
//! - [`RepoManager`]: local CRUD, batch writes, external apply and import
//! - [`ActorLocks`]: reference-counted per-actor mutexes
//! - [`ActorDirectory`]: actor id to DID mapping and takedown status
//! - [`RepoEventHandler`]: receives committed changes ([`EventManagerSink`]
//!   publishes them to the firehose)
//!
//! # Invariants
//!
//! - At most one mutation per actor is in flight; different actors proceed
//!   in parallel.
//! - A commit whose signature does not verify is never persisted or emitted.
//! - Taken-down actors accept no writes.

pub mod actor;
pub mod applier;
pub mod error;
pub mod events;
pub mod lock;
pub mod manager;

pub use actor::{ActorDirectory, ActorRecord, MemActorDirectory};
pub use error::{RepoMgrError, RepoMgrResult};
pub use events::{
    AccountStatus, EventManagerSink, NoopHandler, RepoEvent, RepoEventHandler, RepoEventOp,
    MAX_COMMIT_SLICE,
};
pub use lock::{ActorGuard, ActorLocks};
pub use manager::{CommitInfo, RepoManager, RepoManagerConfig, WriteOp, WriteResult};
