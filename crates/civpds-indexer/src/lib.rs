//! Crawling of repositories hosted on remote PDS instances.
//!
//! # Key Types
//!
//! - [`CrawlDispatcher`]: per-actor job coalescing over a fixed worker pool
//! - [`CrawlJob`]: one actor's crawl, carrying buffered firehose commits
//! - [`RepoFetcher`]: the [`RepoIndexer`] that fetches under a per-host
//!   rate limit and applies through an [`ExternalRepoApplier`]
//! - [`HttpRepoSource`]: fetches CARs over HTTP
//! - [`CatchupForwarder`]: feeds commits from a remote firehose to the
//!   dispatcher
//!
//! # Invariants
//!
//! - At most one worker processes a given actor at a time.
//! - Buffered commits for an actor are applied in arrival order.
//! - A fetch that finds data missing falls back to one full resync.

pub mod dispatcher;
pub mod error;
pub mod fetcher;
pub mod firehose;

pub use dispatcher::{CatchupEvent, CrawlDispatcher, CrawlJob, CrawlTarget, Pds, RepoIndexer};
pub use error::{IndexerError, IndexerResult};
pub use fetcher::{ExternalRepoApplier, HttpRepoSource, RepoFetcher, RepoSource};
pub use firehose::{ActorResolver, CatchupForwarder};
