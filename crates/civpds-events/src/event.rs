//! Firehose message types.
//!
//! Each variant of [`StreamEvent`] maps to one `#<type>` message on the
//! wire. Payloads are encoded by hand as DAG-CBOR maps so the field names
//! and the bytes/link distinctions match what other nodes expect.

use std::collections::BTreeMap;

use civpds_types::cbor::{
    self, get_bool, get_bytes, get_int, get_link, get_list, get_opt_link, get_opt_str, get_str,
    opt_str,
};
use civpds_types::{Cid, Ipld, TypeResult};

use crate::error::{EventError, EventResult};

type Map = BTreeMap<String, Ipld>;

fn s(value: &str) -> Ipld {
    Ipld::String(value.to_string())
}

fn int(value: i64) -> Ipld {
    Ipld::Integer(value.into())
}

/// Current time as an RFC 3339 string with millisecond precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// One record operation inside a commit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOp {
    /// `create`, `update` or `delete`.
    pub action: String,
    pub path: String,
    /// New record CID; `None` for deletes.
    pub cid: Option<Cid>,
}

impl RepoOp {
    fn to_ipld(&self) -> Ipld {
        let mut map = Map::new();
        map.insert("action".into(), s(&self.action));
        map.insert("path".into(), s(&self.path));
        map.insert("cid".into(), cbor::opt_link(self.cid));
        Ipld::Map(map)
    }

    fn from_ipld(value: &Ipld) -> TypeResult<Self> {
        let map = cbor::as_map(value, "repo op")?;
        Ok(Self {
            action: get_str(map, "action", "repo op")?.to_string(),
            path: get_str(map, "path", "repo op")?.to_string(),
            cid: get_opt_link(map, "cid", "repo op")?,
        })
    }
}

/// A repository commit: the ops plus a CAR slice of the new blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub seq: i64,
    /// DID of the repository.
    pub repo: String,
    pub rev: String,
    /// Rev of the previous commit, absent for the first one.
    pub since: Option<String>,
    /// CAR slice holding the commit and every block it introduced.
    pub blocks: Vec<u8>,
    pub ops: Vec<RepoOp>,
    pub commit: Cid,
    pub too_big: bool,
    pub time: String,
}

/// Full-state sync marker for a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub seq: i64,
    pub did: String,
    pub rev: String,
    pub blocks: Vec<u8>,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityEvent {
    pub seq: i64,
    pub did: String,
    pub handle: Option<String>,
    pub time: String,
}

/// Hosting status change of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEvent {
    pub seq: i64,
    pub did: String,
    pub active: bool,
    /// `takendown`, `suspended`, `deleted`, `deactivated` when inactive.
    pub status: Option<String>,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleEvent {
    pub seq: i64,
    pub did: String,
    pub handle: String,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateEvent {
    pub seq: i64,
    pub did: String,
    pub migrate_to: Option<String>,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TombstoneEvent {
    pub seq: i64,
    pub did: String,
    pub time: String,
}

/// Informational message; carries no sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoEvent {
    pub name: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub src: String,
    pub uri: String,
    pub val: String,
    pub cts: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelsEvent {
    pub seq: i64,
    pub labels: Vec<Label>,
}

/// Error frame payload; carries no sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub error: String,
    pub message: Option<String>,
}

impl ErrorFrame {
    pub fn new(error: impl Into<String>, message: Option<String>) -> Self {
        Self {
            error: error.into(),
            message,
        }
    }

    /// The frame sent to a subscriber that fell behind.
    pub fn consumer_too_slow() -> Self {
        Self::new(
            "ConsumerTooSlow",
            Some("subscriber fell behind the event stream".into()),
        )
    }
}

/// A firehose message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Commit(CommitEvent),
    Sync(SyncEvent),
    Identity(IdentityEvent),
    Account(AccountEvent),
    Handle(HandleEvent),
    Migrate(MigrateEvent),
    Tombstone(TombstoneEvent),
    Info(InfoEvent),
    Labels(LabelsEvent),
    Error(ErrorFrame),
}

impl StreamEvent {
    /// Sequence number, or `None` for info and error messages.
    pub fn seq(&self) -> Option<i64> {
        match self {
            Self::Commit(e) => Some(e.seq),
            Self::Sync(e) => Some(e.seq),
            Self::Identity(e) => Some(e.seq),
            Self::Account(e) => Some(e.seq),
            Self::Handle(e) => Some(e.seq),
            Self::Migrate(e) => Some(e.seq),
            Self::Tombstone(e) => Some(e.seq),
            Self::Labels(e) => Some(e.seq),
            Self::Info(_) | Self::Error(_) => None,
        }
    }

    /// Assign the sequence number. Ignored for sequence-less messages.
    pub fn set_seq(&mut self, seq: i64) {
        match self {
            Self::Commit(e) => e.seq = seq,
            Self::Sync(e) => e.seq = seq,
            Self::Identity(e) => e.seq = seq,
            Self::Account(e) => e.seq = seq,
            Self::Handle(e) => e.seq = seq,
            Self::Migrate(e) => e.seq = seq,
            Self::Tombstone(e) => e.seq = seq,
            Self::Labels(e) => e.seq = seq,
            Self::Info(_) | Self::Error(_) => {}
        }
    }

    /// DID of the repository the message is about, if any.
    pub fn repo(&self) -> Option<&str> {
        match self {
            Self::Commit(e) => Some(&e.repo),
            Self::Sync(e) => Some(&e.did),
            Self::Identity(e) => Some(&e.did),
            Self::Account(e) => Some(&e.did),
            Self::Handle(e) => Some(&e.did),
            Self::Migrate(e) => Some(&e.did),
            Self::Tombstone(e) => Some(&e.did),
            Self::Info(_) | Self::Labels(_) | Self::Error(_) => None,
        }
    }

    /// Wire message type, `None` for error frames.
    pub fn message_type(&self) -> Option<&'static str> {
        Some(match self {
            Self::Commit(_) => "#commit",
            Self::Sync(_) => "#sync",
            Self::Identity(_) => "#identity",
            Self::Account(_) => "#account",
            Self::Handle(_) => "#handle",
            Self::Migrate(_) => "#migrate",
            Self::Tombstone(_) => "#tombstone",
            Self::Info(_) => "#info",
            Self::Labels(_) => "#labels",
            Self::Error(_) => return None,
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Payload as a DAG-CBOR map.
    pub fn payload_ipld(&self) -> Ipld {
        let mut m = Map::new();
        match self {
            Self::Commit(e) => {
                m.insert("seq".into(), int(e.seq));
                m.insert("repo".into(), s(&e.repo));
                m.insert("rev".into(), s(&e.rev));
                m.insert("since".into(), opt_str(e.since.as_deref()));
                m.insert("blocks".into(), Ipld::Bytes(e.blocks.clone()));
                m.insert(
                    "ops".into(),
                    Ipld::List(e.ops.iter().map(RepoOp::to_ipld).collect()),
                );
                m.insert("commit".into(), Ipld::Link(e.commit));
                m.insert("tooBig".into(), Ipld::Bool(e.too_big));
                m.insert("time".into(), s(&e.time));
            }
            Self::Sync(e) => {
                m.insert("seq".into(), int(e.seq));
                m.insert("did".into(), s(&e.did));
                m.insert("rev".into(), s(&e.rev));
                m.insert("blocks".into(), Ipld::Bytes(e.blocks.clone()));
                m.insert("time".into(), s(&e.time));
            }
            Self::Identity(e) => {
                m.insert("seq".into(), int(e.seq));
                m.insert("did".into(), s(&e.did));
                m.insert("handle".into(), opt_str(e.handle.as_deref()));
                m.insert("time".into(), s(&e.time));
            }
            Self::Account(e) => {
                m.insert("seq".into(), int(e.seq));
                m.insert("did".into(), s(&e.did));
                m.insert("active".into(), Ipld::Bool(e.active));
                m.insert("status".into(), opt_str(e.status.as_deref()));
                m.insert("time".into(), s(&e.time));
            }
            Self::Handle(e) => {
                m.insert("seq".into(), int(e.seq));
                m.insert("did".into(), s(&e.did));
                m.insert("handle".into(), s(&e.handle));
                m.insert("time".into(), s(&e.time));
            }
            Self::Migrate(e) => {
                m.insert("seq".into(), int(e.seq));
                m.insert("did".into(), s(&e.did));
                m.insert("migrateTo".into(), opt_str(e.migrate_to.as_deref()));
                m.insert("time".into(), s(&e.time));
            }
            Self::Tombstone(e) => {
                m.insert("seq".into(), int(e.seq));
                m.insert("did".into(), s(&e.did));
                m.insert("time".into(), s(&e.time));
            }
            Self::Info(e) => {
                m.insert("name".into(), s(&e.name));
                m.insert("message".into(), opt_str(e.message.as_deref()));
            }
            Self::Labels(e) => {
                m.insert("seq".into(), int(e.seq));
                let labels = e
                    .labels
                    .iter()
                    .map(|l| {
                        let mut lm = Map::new();
                        lm.insert("src".into(), s(&l.src));
                        lm.insert("uri".into(), s(&l.uri));
                        lm.insert("val".into(), s(&l.val));
                        lm.insert("cts".into(), s(&l.cts));
                        Ipld::Map(lm)
                    })
                    .collect();
                m.insert("labels".into(), Ipld::List(labels));
            }
            Self::Error(e) => {
                m.insert("error".into(), s(&e.error));
                m.insert("message".into(), opt_str(e.message.as_deref()));
            }
        }
        Ipld::Map(m)
    }

    /// Rebuild a message from its wire type (`None` for error frames) and
    /// payload.
    pub fn from_payload(message_type: Option<&str>, payload: &Ipld) -> EventResult<Self> {
        let Some(t) = message_type else {
            let m = cbor::as_map(payload, "error frame")?;
            return Ok(Self::Error(ErrorFrame {
                error: get_str(m, "error", "error frame")?.to_string(),
                message: get_opt_str(m, "message", "error frame")?.map(str::to_string),
            }));
        };
        let what = "event payload";
        let m = cbor::as_map(payload, what)?;
        let string = |key: &str| -> TypeResult<String> { Ok(get_str(m, key, what)?.to_string()) };
        let opt = |key: &str| -> TypeResult<Option<String>> {
            Ok(get_opt_str(m, key, what)?.map(str::to_string))
        };

        Ok(match t {
            "#commit" => Self::Commit(CommitEvent {
                seq: get_int(m, "seq", what)?,
                repo: string("repo")?,
                rev: string("rev")?,
                since: opt("since")?,
                blocks: get_bytes(m, "blocks", what)?.to_vec(),
                ops: get_list(m, "ops", what)?
                    .iter()
                    .map(RepoOp::from_ipld)
                    .collect::<TypeResult<_>>()?,
                commit: get_link(m, "commit", what)?,
                too_big: get_bool(m, "tooBig", what)?,
                time: string("time")?,
            }),
            "#sync" => Self::Sync(SyncEvent {
                seq: get_int(m, "seq", what)?,
                did: string("did")?,
                rev: string("rev")?,
                blocks: get_bytes(m, "blocks", what)?.to_vec(),
                time: string("time")?,
            }),
            "#identity" => Self::Identity(IdentityEvent {
                seq: get_int(m, "seq", what)?,
                did: string("did")?,
                handle: opt("handle")?,
                time: string("time")?,
            }),
            "#account" => Self::Account(AccountEvent {
                seq: get_int(m, "seq", what)?,
                did: string("did")?,
                active: get_bool(m, "active", what)?,
                status: opt("status")?,
                time: string("time")?,
            }),
            "#handle" => Self::Handle(HandleEvent {
                seq: get_int(m, "seq", what)?,
                did: string("did")?,
                handle: string("handle")?,
                time: string("time")?,
            }),
            "#migrate" => Self::Migrate(MigrateEvent {
                seq: get_int(m, "seq", what)?,
                did: string("did")?,
                migrate_to: opt("migrateTo")?,
                time: string("time")?,
            }),
            "#tombstone" => Self::Tombstone(TombstoneEvent {
                seq: get_int(m, "seq", what)?,
                did: string("did")?,
                time: string("time")?,
            }),
            "#info" => Self::Info(InfoEvent {
                name: string("name")?,
                message: opt("message")?,
            }),
            "#labels" => Self::Labels(LabelsEvent {
                seq: get_int(m, "seq", what)?,
                labels: get_list(m, "labels", what)?
                    .iter()
                    .map(|l| -> TypeResult<Label> {
                        let lm = cbor::as_map(l, "label")?;
                        Ok(Label {
                            src: get_str(lm, "src", "label")?.to_string(),
                            uri: get_str(lm, "uri", "label")?.to_string(),
                            val: get_str(lm, "val", "label")?.to_string(),
                            cts: get_str(lm, "cts", "label")?.to_string(),
                        })
                    })
                    .collect::<TypeResult<_>>()?,
            }),
            other => return Err(EventError::UnknownType(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_less_messages() {
        let info = StreamEvent::Info(InfoEvent {
            name: "OutdatedCursor".into(),
            message: None,
        });
        assert_eq!(info.seq(), None);
        let err = StreamEvent::Error(ErrorFrame::consumer_too_slow());
        assert_eq!(err.seq(), None);
        assert_eq!(err.message_type(), None);

        let mut tomb = StreamEvent::Tombstone(TombstoneEvent {
            seq: 0,
            did: "did:plc:aaa".into(),
            time: now_rfc3339(),
        });
        assert_eq!(tomb.seq(), Some(0));
        tomb.set_seq(42);
        assert_eq!(tomb.seq(), Some(42));
        assert_eq!(tomb.repo(), Some("did:plc:aaa"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let payload = Ipld::Map(Map::new());
        assert!(matches!(
            StreamEvent::from_payload(Some("#mystery"), &payload),
            Err(EventError::UnknownType(_))
        ));
    }

    #[test]
    fn missing_fields_are_malformed() {
        let mut m = Map::new();
        m.insert("seq".into(), int(1));
        assert!(matches!(
            StreamEvent::from_payload(Some("#commit"), &Ipld::Map(m)),
            Err(EventError::Type(_))
        ));
    }
}
