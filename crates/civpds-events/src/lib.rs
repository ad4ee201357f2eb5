//! Repository event stream for civpds.
//!
//! Commit and account events are persisted with a monotonically increasing
//! sequence number, serialized once into firehose frames and fanned out to
//! subscribers. Subscribers may join from a past sequence number and cross
//! over to the live stream without gaps or duplicates.
//!
//! # Key Types
//!
//! - [`StreamEvent`]: the firehose message union
//! - [`EventFrame`]: an event and its wire encoding
//! - [`Persister`]: sequence assignment and replay storage
//!   ([`MemPersister`], [`DiskPersister`])
//! - [`EventManager`]: broadcast, slow-consumer eviction and replay
//! - [`FirehoseConsumer`]: reads a remote stream over WebSocket
//!
//! # Invariants
//!
//! - Sequence numbers are assigned by the persister and strictly increase.
//! - A subscriber never blocks the broadcaster; one that falls behind is
//!   sent a `ConsumerTooSlow` error frame and dropped.

pub mod consumer;
pub mod error;
pub mod event;
pub mod frame;
pub mod manager;
pub mod persist;

pub use consumer::{connect, subscribe_uri, ConsumerConfig, FirehoseConsumer, FirehoseHandler};
pub use error::{EventError, EventResult};
pub use event::{
    now_rfc3339, AccountEvent, CommitEvent, ErrorFrame, HandleEvent, IdentityEvent, InfoEvent,
    Label, LabelsEvent, MigrateEvent, RepoOp, StreamEvent, SyncEvent, TombstoneEvent,
};
pub use frame::{decode_frame, encode_frame, EventFrame};
pub use manager::{
    accept_all, repo_filter, CleanupHandle, EventFilter, EventManager, EventManagerConfig,
    Subscription,
};
pub use persist::{DiskPersister, DiskPersisterConfig, MemPersister, Persister, SyncMode};
