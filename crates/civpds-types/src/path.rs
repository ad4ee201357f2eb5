use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};
use crate::tid::Tid;

const MAX_RKEY_LEN: usize = 512;

/// Repository key `<nsid>/<rkey>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordPath {
    collection: String,
    rkey: String,
}

impl RecordPath {
    /// Build a path from a collection NSID and record key, validating both.
    pub fn new(collection: impl Into<String>, rkey: impl Into<String>) -> TypeResult<Self> {
        let collection = collection.into();
        let rkey = rkey.into();
        validate_nsid(&collection)?;
        validate_rkey(&rkey)?;
        Ok(Self { collection, rkey })
    }

    /// Path keyed by a TID.
    pub fn with_tid(collection: impl Into<String>, tid: &Tid) -> TypeResult<Self> {
        Self::new(collection, tid.as_str())
    }

    /// Parse `<nsid>/<rkey>`.
    pub fn parse(s: &str) -> TypeResult<Self> {
        match s.split_once('/') {
            Some((collection, rkey)) if !rkey.contains('/') => Self::new(collection, rkey),
            _ => Err(TypeError::InvalidPath(s.to_string())),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn rkey(&self) -> &str {
        &self.rkey
    }

    /// The MST key for this path.
    pub fn key(&self) -> String {
        format!("{}/{}", self.collection, self.rkey)
    }
}

impl fmt::Debug for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordPath({}/{})", self.collection, self.rkey)
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.rkey)
    }
}

impl FromStr for RecordPath {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RecordPath {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<RecordPath> for String {
    fn from(p: RecordPath) -> Self {
        p.key()
    }
}

/// Composite record key: lowercase base32 of the values joined with `|`.
///
/// Gives a stable key for records identified by a tuple, e.g. a vote keyed
/// by `(bill, session)`.
pub fn lid(values: &[&str]) -> String {
    BASE32_NOPAD
        .encode(values.join("|").as_bytes())
        .to_ascii_lowercase()
}

fn validate_nsid(nsid: &str) -> TypeResult<()> {
    let segments: Vec<&str> = nsid.split('.').collect();
    let ok = segments.len() >= 3
        && nsid.len() <= 317
        && segments.iter().all(|seg| {
            !seg.is_empty()
                && seg.len() <= 63
                && seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        });
    if ok {
        Ok(())
    } else {
        Err(TypeError::InvalidPath(format!("bad collection nsid {nsid:?}")))
    }
}

fn validate_rkey(rkey: &str) -> TypeResult<()> {
    let ok = !rkey.is_empty()
        && rkey.len() <= MAX_RKEY_LEN
        && rkey != "."
        && rkey != ".."
        && rkey
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':' | b'~'));
    if ok {
        Ok(())
    } else {
        Err(TypeError::InvalidPath(format!("bad record key {rkey:?}")))
    }
}
