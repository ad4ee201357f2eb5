//! Events emitted after every committed change to an actor's repo.

use async_trait::async_trait;
use civpds_events::{
    now_rfc3339, AccountEvent, CommitEvent, EventManager, RepoOp, StreamEvent, TombstoneEvent,
};
use civpds_repo::DiffOp;
use civpds_types::{Cid, Did, Ipld, Tid, Uid};
use tracing::warn;

/// Slices above this size are announced without their blocks.
pub const MAX_COMMIT_SLICE: usize = 1_000_000;

/// One record change in a [`RepoEvent`].
#[derive(Debug, Clone)]
pub struct RepoEventOp {
    pub action: DiffOp,
    pub path: String,
    pub cid: Option<Cid>,
    /// Decoded record body when it was available in the slice.
    pub record: Option<Ipld>,
}

/// A committed change to one actor's repository.
#[derive(Debug, Clone)]
pub struct RepoEvent {
    pub actor: Uid,
    pub did: Did,
    /// Head before the change; `None` for a new repo or a full import.
    pub old: Option<Cid>,
    pub new: Cid,
    pub rev: Tid,
    pub since: Option<Tid>,
    pub ops: Vec<RepoEventOp>,
    /// CAR bytes of the shard written for this commit.
    pub repo_slice: Vec<u8>,
    /// Origin host for changes applied from another PDS.
    pub pds: Option<u64>,
}

/// Account status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    TakenDown,
    Deleted,
}

/// Receives every change the repo manager commits.
#[async_trait]
pub trait RepoEventHandler: Send + Sync {
    async fn handle_repo_event(&self, event: RepoEvent);

    async fn handle_account_status(&self, _actor: Uid, _did: &Did, _status: AccountStatus) {}
}

/// Handler that drops everything.
pub struct NoopHandler;

#[async_trait]
impl RepoEventHandler for NoopHandler {
    async fn handle_repo_event(&self, _event: RepoEvent) {}
}

impl RepoEvent {
    /// Firehose commit message for this change.
    pub fn to_commit_event(&self) -> CommitEvent {
        let too_big = self.repo_slice.len() > MAX_COMMIT_SLICE;
        CommitEvent {
            seq: 0,
            repo: self.did.to_string(),
            rev: self.rev.as_str().to_string(),
            since: self.since.as_ref().map(|t| t.as_str().to_string()),
            blocks: if too_big {
                Vec::new()
            } else {
                self.repo_slice.clone()
            },
            ops: self
                .ops
                .iter()
                .map(|op| RepoOp {
                    action: op.action.as_str().to_string(),
                    path: op.path.clone(),
                    cid: op.cid,
                })
                .collect(),
            commit: self.new,
            too_big,
            time: now_rfc3339(),
        }
    }
}

/// Publishes repo and account events to the local firehose.
pub struct EventManagerSink {
    events: EventManager,
}

impl EventManagerSink {
    pub fn new(events: EventManager) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }
}

#[async_trait]
impl RepoEventHandler for EventManagerSink {
    async fn handle_repo_event(&self, event: RepoEvent) {
        let commit = event.to_commit_event();
        if let Err(e) = self.events.add_event(StreamEvent::Commit(commit)).await {
            warn!(actor = %event.actor, did = %event.did, rev = %event.rev, error = %e, "failed to publish commit");
        }
    }

    async fn handle_account_status(&self, actor: Uid, did: &Did, status: AccountStatus) {
        let event = match status {
            AccountStatus::Deleted => StreamEvent::Tombstone(TombstoneEvent {
                seq: 0,
                did: did.to_string(),
                time: now_rfc3339(),
            }),
            AccountStatus::Active => StreamEvent::Account(AccountEvent {
                seq: 0,
                did: did.to_string(),
                active: true,
                status: None,
                time: now_rfc3339(),
            }),
            AccountStatus::TakenDown => StreamEvent::Account(AccountEvent {
                seq: 0,
                did: did.to_string(),
                active: false,
                status: Some("takendown".to_string()),
                time: now_rfc3339(),
            }),
        };
        if let Err(e) = self.events.add_event(event).await {
            warn!(%actor, %did, error = %e, "failed to publish account status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civpds_types::{cid_for_cbor, next_tid};

    fn event(slice: usize) -> RepoEvent {
        RepoEvent {
            actor: Uid::new(1),
            did: Did::parse("did:plc:aaa").unwrap(),
            old: None,
            new: cid_for_cbor(b"head"),
            rev: next_tid(),
            since: None,
            ops: vec![RepoEventOp {
                action: DiffOp::Add,
                path: "com.example.profile/self".into(),
                cid: Some(cid_for_cbor(b"rec")),
                record: None,
            }],
            repo_slice: vec![0u8; slice],
            pds: None,
        }
    }

    #[test]
    fn commit_event_carries_ops() {
        let commit = event(10).to_commit_event();
        assert_eq!(commit.repo, "did:plc:aaa");
        assert_eq!(commit.ops[0].action, "create");
        assert_eq!(commit.blocks.len(), 10);
        assert!(!commit.too_big);
    }

    #[test]
    fn oversized_slice_is_flagged() {
        let commit = event(MAX_COMMIT_SLICE + 1).to_commit_event();
        assert!(commit.too_big);
        assert!(commit.blocks.is_empty());
    }
}
