//! DAG-CBOR helpers.
//!
//! All hashed and signed objects in a repository are DAG-CBOR. CIDs are
//! always version 1 with a SHA-256 multihash; the codec is either
//! [`DAG_CBOR`] for structured blocks or [`RAW`] for blob payloads.

use std::collections::BTreeMap;

use libipld::cbor::DagCborCodec;
use libipld::prelude::Codec;
use libipld::{Cid, Ipld};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{TypeError, TypeResult};

/// Multicodec code for DAG-CBOR blocks.
pub const DAG_CBOR: u64 = 0x71;
/// Multicodec code for raw blob payloads.
pub const RAW: u64 = 0x55;
/// Multihash code for SHA-256.
pub const SHA2_256: u64 = 0x12;

/// Encode an IPLD value as canonical DAG-CBOR.
pub fn encode(value: &Ipld) -> TypeResult<Vec<u8>> {
    DagCborCodec
        .encode(value)
        .map_err(|e| TypeError::Cbor(e.to_string()))
}

/// Decode DAG-CBOR bytes into an IPLD value.
pub fn decode(bytes: &[u8]) -> TypeResult<Ipld> {
    DagCborCodec
        .decode(bytes)
        .map_err(|e| TypeError::Cbor(e.to_string()))
}

/// Compute the CIDv1 of `bytes` under `codec` with a SHA-256 multihash.
pub fn cid_for(codec: u64, bytes: &[u8]) -> Cid {
    let digest = Sha256::digest(bytes);
    // version 1, codec, sha2-256, 32-byte digest; every code fits one varint byte.
    let mut raw = Vec::with_capacity(4 + digest.len());
    raw.push(0x01);
    raw.push(codec as u8);
    raw.push(SHA2_256 as u8);
    raw.push(digest.len() as u8);
    raw.extend_from_slice(&digest);
    match Cid::try_from(raw.as_slice()) {
        Ok(cid) => cid,
        Err(e) => unreachable!("well-formed cid bytes rejected: {e}"),
    }
}

/// CID of a DAG-CBOR block.
pub fn cid_for_cbor(bytes: &[u8]) -> Cid {
    cid_for(DAG_CBOR, bytes)
}

/// Encode a value and return both its bytes and its CID.
pub fn encode_block(value: &Ipld) -> TypeResult<(Cid, Vec<u8>)> {
    let bytes = encode(value)?;
    Ok((cid_for_cbor(&bytes), bytes))
}

/// Returns `true` if `bytes` hash to `cid` under the CID's own codec.
pub fn verify_cid(cid: &Cid, bytes: &[u8]) -> bool {
    cid.hash().code() == SHA2_256 && cid_for(cid.codec(), bytes) == *cid
}

/// Convert any serde value into IPLD.
pub fn to_ipld<T: Serialize>(value: &T) -> TypeResult<Ipld> {
    libipld::serde::to_ipld(value).map_err(|e| TypeError::Cbor(e.to_string()))
}

/// Convert IPLD into a serde value.
pub fn from_ipld<T: DeserializeOwned>(value: Ipld) -> TypeResult<T> {
    libipld::serde::from_ipld(value).map_err(|e| TypeError::Cbor(e.to_string()))
}

/// Collect every link reachable inside a decoded value.
pub fn links(value: &Ipld, out: &mut Vec<Cid>) {
    match value {
        Ipld::Link(cid) => out.push(*cid),
        Ipld::List(items) => items.iter().for_each(|i| links(i, out)),
        Ipld::Map(map) => map.values().for_each(|v| links(v, out)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Map accessors used when decoding typed structures by hand.
// ---------------------------------------------------------------------------

fn malformed(what: &'static str, reason: impl Into<String>) -> TypeError {
    TypeError::Malformed {
        what,
        reason: reason.into(),
    }
}

/// View `value` as a map.
pub fn as_map<'a>(value: &'a Ipld, what: &'static str) -> TypeResult<&'a BTreeMap<String, Ipld>> {
    match value {
        Ipld::Map(map) => Ok(map),
        _ => Err(malformed(what, "expected map")),
    }
}

/// Required string field.
pub fn get_str<'a>(
    map: &'a BTreeMap<String, Ipld>,
    key: &str,
    what: &'static str,
) -> TypeResult<&'a str> {
    match map.get(key) {
        Some(Ipld::String(s)) => Ok(s),
        _ => Err(malformed(what, format!("missing string field `{key}`"))),
    }
}

/// Optional string field; `null` counts as absent.
pub fn get_opt_str<'a>(
    map: &'a BTreeMap<String, Ipld>,
    key: &str,
    what: &'static str,
) -> TypeResult<Option<&'a str>> {
    match map.get(key) {
        None | Some(Ipld::Null) => Ok(None),
        Some(Ipld::String(s)) => Ok(Some(s)),
        Some(_) => Err(malformed(what, format!("field `{key}` is not a string"))),
    }
}

/// Required integer field.
pub fn get_int(map: &BTreeMap<String, Ipld>, key: &str, what: &'static str) -> TypeResult<i64> {
    match map.get(key) {
        Some(Ipld::Integer(i)) => {
            i64::try_from(*i).map_err(|_| malformed(what, format!("field `{key}` overflows")))
        }
        _ => Err(malformed(what, format!("missing integer field `{key}`"))),
    }
}

/// Required byte-string field.
pub fn get_bytes<'a>(
    map: &'a BTreeMap<String, Ipld>,
    key: &str,
    what: &'static str,
) -> TypeResult<&'a [u8]> {
    match map.get(key) {
        Some(Ipld::Bytes(b)) => Ok(b),
        _ => Err(malformed(what, format!("missing bytes field `{key}`"))),
    }
}

/// Boolean field; absent or `null` reads as `false`.
pub fn get_bool(map: &BTreeMap<String, Ipld>, key: &str, what: &'static str) -> TypeResult<bool> {
    match map.get(key) {
        None | Some(Ipld::Null) => Ok(false),
        Some(Ipld::Bool(b)) => Ok(*b),
        Some(_) => Err(malformed(what, format!("field `{key}` is not a bool"))),
    }
}

/// Optional string rendered as IPLD (`null` when absent).
pub fn opt_str(value: Option<&str>) -> Ipld {
    value.map(|s| Ipld::String(s.to_string())).unwrap_or(Ipld::Null)
}

/// Required link field.
pub fn get_link(map: &BTreeMap<String, Ipld>, key: &str, what: &'static str) -> TypeResult<Cid> {
    match map.get(key) {
        Some(Ipld::Link(cid)) => Ok(*cid),
        _ => Err(malformed(what, format!("missing link field `{key}`"))),
    }
}

/// Optional link field; `null` counts as absent.
pub fn get_opt_link(
    map: &BTreeMap<String, Ipld>,
    key: &str,
    what: &'static str,
) -> TypeResult<Option<Cid>> {
    match map.get(key) {
        None | Some(Ipld::Null) => Ok(None),
        Some(Ipld::Link(cid)) => Ok(Some(*cid)),
        Some(_) => Err(malformed(what, format!("field `{key}` is not a link"))),
    }
}

/// Required list field.
pub fn get_list<'a>(
    map: &'a BTreeMap<String, Ipld>,
    key: &str,
    what: &'static str,
) -> TypeResult<&'a [Ipld]> {
    match map.get(key) {
        Some(Ipld::List(items)) => Ok(items),
        _ => Err(malformed(what, format!("missing list field `{key}`"))),
    }
}

/// Optional link rendered as IPLD (`null` when absent).
pub fn opt_link(cid: Option<Cid>) -> Ipld {
    cid.map(Ipld::Link).unwrap_or(Ipld::Null)
}
