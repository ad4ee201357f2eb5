//! Actor directory: the collaborator that maps local actor ids to DIDs
//! and tracks account status.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use civpds_types::{Did, Uid};

use crate::error::{RepoMgrError, RepoMgrResult};

/// What the repo manager needs to know about an actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorRecord {
    pub did: Did,
    pub taken_down: bool,
}

/// Lookup and status updates for local actors.
#[async_trait]
pub trait ActorDirectory: Send + Sync {
    /// `None` when the actor is not registered.
    async fn get(&self, actor: Uid) -> RepoMgrResult<Option<ActorRecord>>;

    async fn actor_for_did(&self, did: &Did) -> RepoMgrResult<Option<Uid>>;

    async fn register(&self, actor: Uid, did: Did) -> RepoMgrResult<()>;

    async fn set_taken_down(&self, actor: Uid, taken_down: bool) -> RepoMgrResult<()>;

    async fn remove(&self, actor: Uid) -> RepoMgrResult<()>;
}

/// In-memory actor directory.
#[derive(Default)]
pub struct MemActorDirectory {
    actors: RwLock<HashMap<Uid, ActorRecord>>,
}

impl MemActorDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActorDirectory for MemActorDirectory {
    async fn get(&self, actor: Uid) -> RepoMgrResult<Option<ActorRecord>> {
        Ok(self.actors.read().expect("lock poisoned").get(&actor).cloned())
    }

    async fn actor_for_did(&self, did: &Did) -> RepoMgrResult<Option<Uid>> {
        Ok(self
            .actors
            .read()
            .expect("lock poisoned")
            .iter()
            .find(|(_, rec)| &rec.did == did)
            .map(|(uid, _)| *uid))
    }

    async fn register(&self, actor: Uid, did: Did) -> RepoMgrResult<()> {
        self.actors
            .write()
            .expect("lock poisoned")
            .entry(actor)
            .or_insert(ActorRecord {
                did,
                taken_down: false,
            });
        Ok(())
    }

    async fn set_taken_down(&self, actor: Uid, taken_down: bool) -> RepoMgrResult<()> {
        let mut actors = self.actors.write().expect("lock poisoned");
        let rec = actors
            .get_mut(&actor)
            .ok_or(RepoMgrError::UnknownActor(actor))?;
        rec.taken_down = taken_down;
        Ok(())
    }

    async fn remove(&self, actor: Uid) -> RepoMgrResult<()> {
        self.actors.write().expect("lock poisoned").remove(&actor);
        Ok(())
    }
}
