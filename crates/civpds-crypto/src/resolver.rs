use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use civpds_types::Did;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{parse_did_key, Signature, SigningKey, VerifyingKey};
use crate::plc::DirectoryClient;

/// Signs commit bytes on behalf of an actor.
///
/// The repository engine only ever sees this trait; it never holds private
/// key material.
#[async_trait]
pub trait CommitSigner: Send + Sync {
    async fn sign(&self, did: &Did, bytes: &[u8]) -> CryptoResult<Signature>;
}

/// Resolves the signing key an actor advertises.
#[async_trait]
pub trait SigningKeyResolver: Send + Sync {
    async fn resolve(&self, did: &Did) -> CryptoResult<VerifyingKey>;
}

/// Signer holding a single in-memory key, for tests and tooling.
pub struct LocalSigner {
    key: SigningKey,
}

impl LocalSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

#[async_trait]
impl CommitSigner for LocalSigner {
    async fn sign(&self, _did: &Did, bytes: &[u8]) -> CryptoResult<Signature> {
        Ok(self.key.sign(bytes))
    }
}

/// In-memory `did -> signing key` registry.
#[derive(Default)]
pub struct MemKeyResolver {
    keys: RwLock<HashMap<Did, VerifyingKey>>,
}

impl MemKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, did: Did, key: VerifyingKey) {
        self.keys.write().expect("lock poisoned").insert(did, key);
    }

    /// Register a key given in `did:key` form.
    pub fn insert_did_key(&self, did: Did, did_key: &str) -> CryptoResult<()> {
        self.insert(did, parse_did_key(did_key)?);
        Ok(())
    }

    pub fn remove(&self, did: &Did) {
        self.keys.write().expect("lock poisoned").remove(did);
    }
}

#[async_trait]
impl SigningKeyResolver for MemKeyResolver {
    async fn resolve(&self, did: &Did) -> CryptoResult<VerifyingKey> {
        self.keys
            .read()
            .expect("lock poisoned")
            .get(did)
            .cloned()
            .ok_or_else(|| CryptoError::NoSigningKey(did.clone()))
    }
}

/// Resolves hosted actors locally and everyone else through the directory.
///
/// Directory answers are cached for `ttl`; local answers are never cached
/// here since the local resolver keeps its own cache.
pub struct DirectoryKeyResolver {
    local: Arc<dyn SigningKeyResolver>,
    directory: Arc<dyn DirectoryClient>,
    ttl: Duration,
    cache: RwLock<HashMap<Did, (VerifyingKey, Instant)>>,
}

impl DirectoryKeyResolver {
    pub fn new(local: Arc<dyn SigningKeyResolver>, directory: Arc<dyn DirectoryClient>) -> Self {
        Self {
            local,
            directory,
            ttl: Duration::from_secs(300),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Drop a cached directory answer, e.g. after the actor rotated keys.
    pub fn invalidate(&self, did: &Did) {
        self.cache.write().expect("lock poisoned").remove(did);
    }

    fn cached(&self, did: &Did) -> Option<VerifyingKey> {
        let cache = self.cache.read().expect("lock poisoned");
        match cache.get(did) {
            Some((key, expires_at)) if *expires_at > Instant::now() => Some(key.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl SigningKeyResolver for DirectoryKeyResolver {
    async fn resolve(&self, did: &Did) -> CryptoResult<VerifyingKey> {
        match self.local.resolve(did).await {
            Err(CryptoError::NoSigningKey(_)) => {}
            other => return other,
        }
        if let Some(key) = self.cached(did) {
            return Ok(key);
        }
        let Some(did_key) = self.directory.atproto_key(did).await? else {
            return Err(CryptoError::NoSigningKey(did.clone()));
        };
        let key = parse_did_key(&did_key)?;
        debug!(%did, "signing key resolved through directory");
        self.cache
            .write()
            .expect("lock poisoned")
            .insert(did.clone(), (key.clone(), Instant::now() + self.ttl));
        Ok(key)
    }
}
