//! civpds node.
//!
//! Loads [`NodeConfig`], opens the CAR store, key manager, event stream,
//! repo manager and crawl dispatcher as one [`Node`], and serves the
//! health endpoint.

pub mod config;
pub mod error;
pub mod node;
pub mod router;
pub mod server;

pub use config::{
    CrawlSection, EventsSection, KeysSection, NodeConfig, RepoSection, ServerSection,
    StorageSection,
};
pub use error::{ServerError, ServerResult};
pub use node::Node;
pub use router::{build_router, AppState};
pub use server::PdsServer;
