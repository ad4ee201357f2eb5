//! Indexer traits backed by the repo manager.

use async_trait::async_trait;
use bytes::Bytes;
use civpds_events::CommitEvent;
use civpds_indexer::{ActorResolver, CrawlTarget, ExternalRepoApplier, IndexerError, IndexerResult};
use civpds_types::{Did, Tid, Uid};

use crate::error::RepoMgrError;
use crate::manager::RepoManager;

#[async_trait]
impl ExternalRepoApplier for RepoManager {
    async fn current_rev(&self, actor: Uid) -> IndexerResult<Option<Tid>> {
        match self.get_actor_repo_rev(actor).await {
            Ok(rev) => Ok(Some(rev)),
            Err(RepoMgrError::NoRepo(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn import_repo(
        &self,
        target: &CrawlTarget,
        car: Bytes,
        since: Option<Tid>,
    ) -> IndexerResult<()> {
        self.import_new_repo(target.actor, &target.did, &car, since.as_ref())
            .await?;
        Ok(())
    }

    async fn apply_commit(&self, target: &CrawlTarget, commit: &CommitEvent) -> IndexerResult<()> {
        if commit.too_big {
            // The blocks were left out of the event; only a fetch can recover them.
            return Err(IndexerError::MissingBlock(format!(
                "commit {} for {} was too big to inline",
                commit.rev, commit.repo
            )));
        }
        let rev = Tid::parse(&commit.rev).map_err(RepoMgrError::from)?;
        let since = commit
            .since
            .as_deref()
            .map(Tid::parse)
            .transpose()
            .map_err(RepoMgrError::from)?;
        self.handle_external_actor_event(
            target.pds.id,
            target.actor,
            &target.did,
            since.as_ref(),
            &rev,
            &commit.blocks,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ActorResolver for RepoManager {
    async fn resolve_actor(&self, did: &Did) -> IndexerResult<Option<Uid>> {
        Ok(self.directory().actor_for_did(did).await?)
    }
}
