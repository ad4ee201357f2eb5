use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};

/// Local numeric actor identifier.
///
/// Assigned by the account layer; the shard index and object-storage paths
/// are keyed by it rather than by DID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u64);

impl Uid {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Uid {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Decentralized identifier, e.g. `did:plc:ewvi7nxzyoun6zhxrhs64oiz`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    /// Parse `did:<method>:<id>`.
    pub fn parse(s: &str) -> TypeResult<Self> {
        let mut parts = s.splitn(3, ':');
        let (scheme, method, id) = (parts.next(), parts.next(), parts.next());
        match (scheme, method, id) {
            (Some("did"), Some(m), Some(id))
                if !m.is_empty()
                    && m.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                    && !id.is_empty()
                    && s.len() <= 2048 =>
            {
                Ok(Self(s.to_string()))
            }
            _ => Err(TypeError::InvalidDid(s.to_string())),
        }
    }

    /// The DID method (`plc`, `key`, `web`, ...).
    pub fn method(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self.0)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Did {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Did {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Did> for String {
    fn from(did: Did) -> Self {
        did.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_parse_and_method() {
        let did = Did::parse("did:plc:aaa").unwrap();
        assert_eq!(did.method(), "plc");
        assert_eq!(did.to_string(), "did:plc:aaa");
    }

    #[test]
    fn did_rejects_malformed() {
        for bad in ["", "did", "did:plc", "did::x", "dad:plc:x", "did:PLC:x"] {
            assert!(Did::parse(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn uid_displays_as_number() {
        assert_eq!(Uid::new(17).to_string(), "17");
    }
}
