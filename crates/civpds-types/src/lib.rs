//! Foundation types for the civic-engagement PDS.
//!
//! Every other `civpds-*` crate depends on this one. It carries the
//! identifiers that appear on the wire and in storage, plus the DAG-CBOR
//! helpers used to hash and sign repository objects.
//!
//! # Key Types
//!
//! - [`Tid`] / [`TidClock`] -- time-ordered identifiers for record keys and commit revs
//! - [`Did`] -- decentralized identifier of an actor
//! - [`Uid`] -- local numeric actor id used by the shard index
//! - [`RecordPath`] -- `<nsid>/<rkey>` key into a repository MST
//! - [`cbor`] -- DAG-CBOR encode/decode and CID derivation

pub mod cbor;
pub mod error;
pub mod ident;
pub mod path;
pub mod tid;

pub use cbor::{cid_for, cid_for_cbor, DAG_CBOR, RAW};
pub use error::{TypeError, TypeResult};
pub use ident::{Did, Uid};
pub use libipld::{Cid, Ipld};
pub use path::{lid, RecordPath};
pub use tid::{next_tid, Tid, TidClock};
