//! Directory (PLC) operations.
//!
//! Only creation and tombstoning are needed: a new actor publishes a signed
//! `plc_operation`, and account deletion publishes a `plc_tombstone`. The DID
//! of a new actor is derived from the hash of its signed genesis operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use civpds_types::cbor;
use civpds_types::{Did, Ipld};
use data_encoding::BASE32_NOPAD;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{Signature, VerifyingKey};

/// A service endpoint advertised in a DID document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlcService {
    pub kind: String,
    pub endpoint: String,
}

impl PlcService {
    /// The `atproto_pds` service entry pointing at `endpoint`.
    pub fn pds(endpoint: impl Into<String>) -> Self {
        Self {
            kind: "AtprotoPersonalDataServer".to_string(),
            endpoint: endpoint.into(),
        }
    }
}

/// A `plc_operation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlcOperation {
    /// CID (string form) of the previous operation; `None` for genesis.
    pub prev: Option<String>,
    pub services: BTreeMap<String, PlcService>,
    pub also_known_as: Vec<String>,
    pub rotation_keys: Vec<String>,
    pub verification_methods: BTreeMap<String, String>,
    /// base64url (unpadded) compact signature.
    pub sig: Option<String>,
}

/// A `plc_tombstone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlcTombstone {
    pub prev: String,
    pub sig: Option<String>,
}

/// Either directory operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryOp {
    Operation(PlcOperation),
    Tombstone(PlcTombstone),
}

fn strings(items: &[String]) -> Ipld {
    Ipld::List(items.iter().cloned().map(Ipld::String).collect())
}

fn sig_ipld(sig: &Option<String>, out: &mut BTreeMap<String, Ipld>) {
    if let Some(sig) = sig {
        out.insert("sig".to_string(), Ipld::String(sig.clone()));
    }
}

fn encode_sig(sig: &Signature) -> String {
    URL_SAFE_NO_PAD.encode(sig.as_bytes())
}

fn decode_sig(sig: &str) -> CryptoResult<Signature> {
    let bytes = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|_| CryptoError::InvalidSignature)?;
    Signature::from_compact(&bytes)
}

impl PlcOperation {
    /// Genesis operation for a new actor.
    pub fn genesis(
        handle: &str,
        pds_endpoint: &str,
        signing_did_key: &str,
        rotation_keys: Vec<String>,
    ) -> Self {
        Self {
            prev: None,
            services: BTreeMap::from([("atproto_pds".to_string(), PlcService::pds(pds_endpoint))]),
            also_known_as: vec![format!("at://{handle}")],
            rotation_keys,
            verification_methods: BTreeMap::from([(
                "atproto".to_string(),
                signing_did_key.to_string(),
            )]),
            sig: None,
        }
    }

    fn to_ipld(&self, with_sig: bool) -> Ipld {
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Ipld::String("plc_operation".into()));
        map.insert(
            "prev".to_string(),
            self.prev.clone().map(Ipld::String).unwrap_or(Ipld::Null),
        );
        let services = self
            .services
            .iter()
            .map(|(id, svc)| {
                let entry = BTreeMap::from([
                    ("type".to_string(), Ipld::String(svc.kind.clone())),
                    ("endpoint".to_string(), Ipld::String(svc.endpoint.clone())),
                ]);
                (id.clone(), Ipld::Map(entry))
            })
            .collect();
        map.insert("services".to_string(), Ipld::Map(services));
        map.insert("alsoKnownAs".to_string(), strings(&self.also_known_as));
        map.insert("rotationKeys".to_string(), strings(&self.rotation_keys));
        map.insert(
            "verificationMethods".to_string(),
            Ipld::Map(
                self.verification_methods
                    .iter()
                    .map(|(k, v)| (k.clone(), Ipld::String(v.clone())))
                    .collect(),
            ),
        );
        if with_sig {
            sig_ipld(&self.sig, &mut map);
        }
        Ipld::Map(map)
    }

    /// DAG-CBOR bytes that are signed (everything but `sig`).
    pub fn unsigned_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(cbor::encode(&self.to_ipld(false))?)
    }

    /// DAG-CBOR bytes of the signed operation.
    pub fn signed_bytes(&self) -> CryptoResult<Vec<u8>> {
        if self.sig.is_none() {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(cbor::encode(&self.to_ipld(true))?)
    }

    /// Attach a signature.
    pub fn with_signature(mut self, sig: &Signature) -> Self {
        self.sig = Some(encode_sig(sig));
        self
    }

    /// Verify the signature against `key`.
    pub fn verify(&self, key: &VerifyingKey) -> CryptoResult<()> {
        let sig = decode_sig(self.sig.as_deref().ok_or(CryptoError::InvalidSignature)?)?;
        key.verify(&self.unsigned_bytes()?, &sig)
    }

    /// `did:plc:` identifier derived from the signed genesis operation.
    pub fn did(&self) -> CryptoResult<Did> {
        let digest = Sha256::digest(self.signed_bytes()?);
        let encoded = BASE32_NOPAD.encode(&digest).to_ascii_lowercase();
        Ok(Did::parse(&format!("did:plc:{}", &encoded[..24]))?)
    }

    /// The `atproto` verification method: the actor's commit signing key.
    pub fn atproto_key(&self) -> Option<&str> {
        self.verification_methods.get("atproto").map(String::as_str)
    }

    /// CID string of the signed operation, used as `prev` by successors.
    pub fn cid(&self) -> CryptoResult<String> {
        Ok(cbor::cid_for_cbor(&self.signed_bytes()?).to_string())
    }
}

impl PlcTombstone {
    pub fn new(prev: impl Into<String>) -> Self {
        Self {
            prev: prev.into(),
            sig: None,
        }
    }

    fn to_ipld(&self, with_sig: bool) -> Ipld {
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Ipld::String("plc_tombstone".into()));
        map.insert("prev".to_string(), Ipld::String(self.prev.clone()));
        if with_sig {
            sig_ipld(&self.sig, &mut map);
        }
        Ipld::Map(map)
    }

    pub fn unsigned_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(cbor::encode(&self.to_ipld(false))?)
    }

    pub fn with_signature(mut self, sig: &Signature) -> Self {
        self.sig = Some(encode_sig(sig));
        self
    }

    pub fn verify(&self, key: &VerifyingKey) -> CryptoResult<()> {
        let sig = decode_sig(self.sig.as_deref().ok_or(CryptoError::InvalidSignature)?)?;
        key.verify(&self.unsigned_bytes()?, &sig)
    }
}

impl DirectoryOp {
    /// JSON body accepted by a directory server.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DirectoryOp::Operation(op) => {
                let services: serde_json::Map<String, serde_json::Value> = op
                    .services
                    .iter()
                    .map(|(id, svc)| {
                        (
                            id.clone(),
                            json!({ "type": svc.kind, "endpoint": svc.endpoint }),
                        )
                    })
                    .collect();
                json!({
                    "type": "plc_operation",
                    "prev": op.prev,
                    "services": services,
                    "alsoKnownAs": op.also_known_as,
                    "rotationKeys": op.rotation_keys,
                    "verificationMethods": op.verification_methods,
                    "sig": op.sig,
                })
            }
            DirectoryOp::Tombstone(tomb) => json!({
                "type": "plc_tombstone",
                "prev": tomb.prev,
                "sig": tomb.sig,
            }),
        }
    }
}

/// The external directory: submits operations and answers key lookups.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn submit(&self, did: &Did, op: DirectoryOp) -> CryptoResult<()>;

    /// The actor's current `atproto` signing key in `did:key` form. `None`
    /// when the DID is unknown or tombstoned.
    async fn atproto_key(&self, did: &Did) -> CryptoResult<Option<String>>;
}

/// Directory client that records operations in memory.
#[derive(Default)]
pub struct MemDirectory {
    ops: RwLock<HashMap<Did, Vec<DirectoryOp>>>,
}

impl MemDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations submitted for `did`, oldest first.
    pub fn operations(&self, did: &Did) -> Vec<DirectoryOp> {
        self.ops
            .read()
            .expect("lock poisoned")
            .get(did)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns `true` if the last operation for `did` is a tombstone.
    pub fn is_tombstoned(&self, did: &Did) -> bool {
        matches!(
            self.operations(did).last(),
            Some(DirectoryOp::Tombstone(_))
        )
    }
}

#[async_trait]
impl DirectoryClient for MemDirectory {
    async fn submit(&self, did: &Did, op: DirectoryOp) -> CryptoResult<()> {
        self.ops
            .write()
            .expect("lock poisoned")
            .entry(did.clone())
            .or_default()
            .push(op);
        Ok(())
    }

    async fn atproto_key(&self, did: &Did) -> CryptoResult<Option<String>> {
        Ok(match self.operations(did).last() {
            Some(DirectoryOp::Operation(op)) => op.atproto_key().map(str::to_string),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{did_key, SigningKey};

    fn signed_genesis(rotation: &SigningKey) -> PlcOperation {
        let signing = SigningKey::generate();
        let op = PlcOperation::genesis(
            "alice.example.com",
            "https://pds.example.com",
            &signing.did_key(),
            vec![did_key(&rotation.verifying_key())],
        );
        let sig = rotation.sign(&op.unsigned_bytes().unwrap());
        op.with_signature(&sig)
    }

    #[test]
    fn genesis_signature_verifies() {
        let rotation = SigningKey::generate();
        let op = signed_genesis(&rotation);
        assert!(op.verify(&rotation.verifying_key()).is_ok());
        assert!(op.verify(&SigningKey::generate().verifying_key()).is_err());
    }

    #[test]
    fn did_is_24_char_base32_of_signed_op() {
        let op = signed_genesis(&SigningKey::generate());
        let did = op.did().unwrap();
        let suffix = did.as_str().strip_prefix("did:plc:").unwrap();
        assert_eq!(suffix.len(), 24);
        assert!(suffix.bytes().all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b)));
        assert_eq!(op.did().unwrap(), did);
    }

    #[test]
    fn unsigned_operation_has_no_did() {
        let op = PlcOperation::genesis("a.b", "https://x", "did:key:z", vec![]);
        assert!(op.did().is_err());
    }

    #[test]
    fn sig_is_base64url_unpadded() {
        let op = signed_genesis(&SigningKey::generate());
        let sig = op.sig.as_deref().unwrap();
        assert_eq!(sig.len(), 86);
        assert!(!sig.contains('=') && !sig.contains('+') && !sig.contains('/'));
    }

    #[tokio::test]
    async fn tombstone_round_trip_through_directory() {
        let rotation = SigningKey::generate();
        let genesis = signed_genesis(&rotation);
        let did = genesis.did().unwrap();
        let dir = MemDirectory::new();
        dir.submit(&did, DirectoryOp::Operation(genesis.clone()))
            .await
            .unwrap();
        assert!(!dir.is_tombstoned(&did));
        assert_eq!(
            dir.atproto_key(&did).await.unwrap().as_deref(),
            genesis.atproto_key()
        );

        let tomb = PlcTombstone::new(genesis.cid().unwrap());
        let sig = rotation.sign(&tomb.unsigned_bytes().unwrap());
        let tomb = tomb.with_signature(&sig);
        assert!(tomb.verify(&rotation.verifying_key()).is_ok());
        dir.submit(&did, DirectoryOp::Tombstone(tomb)).await.unwrap();
        assert!(dir.is_tombstoned(&did));
        assert_eq!(dir.operations(&did).len(), 2);
        assert_eq!(dir.atproto_key(&did).await.unwrap(), None);
    }

    #[test]
    fn json_body_uses_directory_field_names() {
        let op = signed_genesis(&SigningKey::generate());
        let body = DirectoryOp::Operation(op.clone()).to_json();
        assert_eq!(body["type"], "plc_operation");
        assert!(body["prev"].is_null());
        assert_eq!(body["verificationMethods"]["atproto"], op.atproto_key().unwrap());
        assert_eq!(body["services"]["atproto_pds"]["type"], "AtprotoPersonalDataServer");
        assert_eq!(body["alsoKnownAs"][0], "at://alice.example.com");
        assert_eq!(body["sig"], op.sig.clone().unwrap());

        let tomb = DirectoryOp::Tombstone(PlcTombstone::new("bafyprev")).to_json();
        assert_eq!(tomb["type"], "plc_tombstone");
        assert_eq!(tomb["prev"], "bafyprev");
    }
}
