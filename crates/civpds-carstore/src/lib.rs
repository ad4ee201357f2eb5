//! Sharded CAR store.
//!
//! Repository blocks are persisted as immutable CAR shards in object storage
//! (`sh-<actor>/seq-<seq>`), one shard per commit, and every block is indexed
//! in SQLite by `(cid, actor)` with its byte offset inside the shard. Writes
//! accumulate in a [`DeltaSession`] and land as one new shard on
//! [`DeltaSession::close_with_root`]. Reads go through an [`ActorView`] that
//! caches blocks for the life of a session and can prefetch small shards
//! whole.
//!
//! # Tables
//!
//! - `car_shards{id, actor_id, seq, rev, root, path, data_start, created_at}`
//! - `block_refs{id, cid, shard_id, actor_id, byte_offset}`
//!
//! A shard row and its block refs are always written in one transaction.

pub mod error;
pub mod meta;
pub mod session;
pub mod store;
pub mod view;

pub use error::{CarStoreError, CarStoreResult};
pub use meta::{BlockRef, NewBlockRef, NewShard, Shard, ShardIndex, REF_BATCH_SIZE};
pub use session::DeltaSession;
pub use store::{CarStore, CarStoreConfig, CompactionReport};
pub use view::ActorView;
