//! Routes commits read from a remote firehose into the crawl dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use civpds_events::{EventError, EventResult, FirehoseHandler, StreamEvent};
use civpds_types::{Did, Uid};
use tracing::debug;

use crate::dispatcher::{CatchupEvent, CrawlDispatcher, CrawlTarget, Pds};
use crate::error::IndexerResult;

/// Maps a remote DID to the local actor id that mirrors it.
#[async_trait]
pub trait ActorResolver: Send + Sync {
    /// `None` for DIDs this node does not mirror.
    async fn resolve_actor(&self, did: &Did) -> IndexerResult<Option<Uid>>;
}

/// [`FirehoseHandler`] that turns each commit from one PDS into catchup
/// for the dispatcher.
pub struct CatchupForwarder {
    dispatcher: Arc<CrawlDispatcher>,
    pds: Arc<Pds>,
    actors: Arc<dyn ActorResolver>,
}

impl CatchupForwarder {
    pub fn new(dispatcher: Arc<CrawlDispatcher>, pds: Arc<Pds>, actors: Arc<dyn ActorResolver>) -> Self {
        Self {
            dispatcher,
            pds,
            actors,
        }
    }
}

#[async_trait]
impl FirehoseHandler for CatchupForwarder {
    async fn handle(&self, event: StreamEvent) -> EventResult<()> {
        let StreamEvent::Commit(commit) = event else {
            return Ok(());
        };
        let did = Did::parse(&commit.repo)?;
        let actor = self
            .actors
            .resolve_actor(&did)
            .await
            .map_err(|e| EventError::Handler(e.to_string()))?;
        let Some(actor) = actor else {
            debug!(pds = %self.pds.host, %did, seq = commit.seq, "commit for unmirrored repo");
            return Ok(());
        };
        self.dispatcher
            .add_catchup(CatchupEvent {
                target: CrawlTarget {
                    actor,
                    did,
                    pds: self.pds.clone(),
                },
                commit,
            })
            .await
            .map_err(|e| EventError::Handler(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{CrawlJob, RepoIndexer};
    use civpds_events::{now_rfc3339, AccountEvent, CommitEvent};
    use std::sync::Mutex;
    use std::time::Duration;

    struct OneActor;

    #[async_trait]
    impl ActorResolver for OneActor {
        async fn resolve_actor(&self, did: &Did) -> IndexerResult<Option<Uid>> {
            Ok((did.as_str() == "did:plc:known").then(|| Uid::new(4)))
        }
    }

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<(Uid, String)>>,
    }

    #[async_trait]
    impl RepoIndexer for Collect {
        async fn fetch_and_index(&self, job: &CrawlJob) -> IndexerResult<()> {
            let events = job.take_catchup();
            let mut seen = self.seen.lock().unwrap();
            seen.extend(events.into_iter().map(|e| (e.target.actor, e.commit.rev)));
            Ok(())
        }
    }

    fn commit(repo: &str, rev: &str) -> StreamEvent {
        StreamEvent::Commit(CommitEvent {
            seq: 1,
            repo: repo.into(),
            rev: rev.into(),
            since: None,
            blocks: Vec::new(),
            ops: Vec::new(),
            commit: civpds_types::cid_for_cbor(rev.as_bytes()),
            too_big: false,
            time: now_rfc3339(),
        })
    }

    #[tokio::test]
    async fn forwards_commits_for_known_actors() {
        let indexer = Arc::new(Collect::default());
        let dispatcher = Arc::new(CrawlDispatcher::start(indexer.clone(), 1).unwrap());
        let pds = Arc::new(Pds {
            id: 2,
            host: "remote.example".into(),
            crawl_rate: 5.0,
        });
        let forwarder = CatchupForwarder::new(dispatcher.clone(), pds, Arc::new(OneActor));

        forwarder.handle(commit("did:plc:other", "a")).await.unwrap();
        forwarder
            .handle(StreamEvent::Account(AccountEvent {
                seq: 2,
                did: "did:plc:known".into(),
                active: true,
                status: None,
                time: now_rfc3339(),
            }))
            .await
            .unwrap();
        forwarder.handle(commit("did:plc:known", "b")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while indexer.seen.lock().unwrap().is_empty() || !dispatcher.is_idle() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*indexer.seen.lock().unwrap(), vec![(Uid::new(4), "b".to_string())]);
        dispatcher.shutdown().await;
    }
}
