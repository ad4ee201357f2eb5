//! Content-addressed block storage for the civic PDS.
//!
//! Every repository object -- commits, MST nodes, records -- is an immutable
//! DAG-CBOR block identified by its CID. This crate holds the block model,
//! the [`BlockStore`] abstraction that repository sessions are written
//! against, CAR v1 framing used for shards and sync, and the
//! [`ObjectStorage`] backends that shards are persisted to.
//!
//! # Storage Backends
//!
//! - [`MemBlockStore`] -- `HashMap`-based block store for imports and tests
//! - [`MemObjectStorage`] -- in-memory object storage
//! - [`FsObjectStorage`] -- directory-backed object storage
//!
//! # Design Rules
//!
//! 1. Blocks are immutable; the same CID always maps to the same bytes.
//! 2. Reads that cross a trust boundary verify the CID before returning data.
//! 3. Raw-codec blocks are opaque and never traversed.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod block;
pub mod car;
pub mod error;
pub mod memory;
pub mod objects;
pub mod traits;
pub mod walk;

pub use block::Block;
pub use car::{CarHeader, CarReader, CarWriter};
pub use error::{StoreError, StoreResult};
pub use memory::MemBlockStore;
pub use objects::{FsObjectStorage, MemObjectStorage, ObjectStorage, CAR_CONTENT_TYPE, OCTET_STREAM};
pub use traits::BlockStore;
pub use walk::collect_reachable;
