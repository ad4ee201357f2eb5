use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use civpds_store::{ObjectStorage, StoreError, OCTET_STREAM};
use civpds_types::Did;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{did_key, Signature, SigningKey, VerifyingKey};
use crate::kms::{actor_context, Kms};
use crate::resolver::{CommitSigner, SigningKeyResolver};

/// Key manager tuning.
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// KMS master-key alias that actor keys are encrypted under.
    pub actor_key_alias: String,
    /// KMS asymmetric key alias used for directory operations.
    pub directory_key_alias: String,
    /// Lifetime of a decrypted key in the signing cache.
    pub signing_ttl: Duration,
    /// Lifetime of a ciphertext in the encrypted cache.
    pub encrypted_ttl: Duration,
    /// How often expired cache entries are evicted.
    pub sweep_interval: Duration,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            actor_key_alias: "alias/actor-keys".to_string(),
            directory_key_alias: "alias/directory-rotation".to_string(),
            signing_ttl: Duration::from_secs(300),
            encrypted_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

struct CachedCiphertext {
    ciphertext: Vec<u8>,
    expires_at: Instant,
}

struct CachedKey {
    key: Arc<SigningKey>,
    expires_at: Instant,
}

#[derive(Default)]
struct KeyCaches {
    encrypted: HashMap<Did, CachedCiphertext>,
    signing: HashMap<Did, CachedKey>,
}

/// Per-actor signing keys with envelope encryption and TTL caches.
///
/// Two caches are keyed by DID: ciphertexts and decrypted keys. The signing
/// cache has the shorter lifetime; when only the ciphertext survives the key
/// is decrypted again on demand. A background task evicts expired entries
/// every `sweep_interval` until [`KeyManager::flush`] is called.
pub struct KeyManager {
    kms: Arc<dyn Kms>,
    keystore: Arc<dyn ObjectStorage>,
    config: KeyManagerConfig,
    caches: Mutex<KeyCaches>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl KeyManager {
    /// Create a key manager and start its expiry task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        kms: Arc<dyn Kms>,
        keystore: Arc<dyn ObjectStorage>,
        config: KeyManagerConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            kms,
            keystore,
            config,
            caches: Mutex::new(KeyCaches::default()),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        });
        let handle = tokio::spawn(Self::sweep_loop(
            Arc::downgrade(&manager),
            manager.shutdown.clone(),
            manager.config.sweep_interval,
        ));
        *manager.sweeper.lock().expect("lock poisoned") = Some(handle);
        manager
    }

    async fn sweep_loop(manager: Weak<Self>, shutdown: CancellationToken, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else { break };
                    manager.evict_expired();
                }
            }
        }
    }

    /// Draw a fresh secp256k1 key from the CSPRNG.
    pub fn create_signing_key() -> SigningKey {
        SigningKey::generate()
    }

    /// Object-storage key of an actor's encrypted signing key.
    pub fn keystore_path(did: &Did) -> String {
        format!("{did}.kms")
    }

    /// Encrypt `key` for `did` and persist the ciphertext.
    pub async fn create_encrypted_key(&self, did: &Did, key: SigningKey) -> CryptoResult<()> {
        let ciphertext = self
            .kms
            .encrypt(
                &self.config.actor_key_alias,
                &key.to_bytes(),
                &actor_context(did.as_str()),
            )
            .await?;
        self.keystore
            .put(
                &Self::keystore_path(did),
                Bytes::from(ciphertext.clone()),
                OCTET_STREAM,
            )
            .await?;

        let now = Instant::now();
        let mut caches = self.caches.lock().expect("lock poisoned");
        caches.encrypted.insert(
            did.clone(),
            CachedCiphertext {
                ciphertext,
                expires_at: now + self.config.encrypted_ttl,
            },
        );
        caches.signing.insert(
            did.clone(),
            CachedKey {
                key: Arc::new(key),
                expires_at: now + self.config.signing_ttl,
            },
        );
        info!(did = %did, "created encrypted signing key");
        Ok(())
    }

    /// Sign `message` with the actor's key, loading and decrypting it if it
    /// is not cached.
    pub async fn sign_for_actor(&self, did: &Did, message: &[u8]) -> CryptoResult<Signature> {
        let key = self.signing_key(did).await?;
        Ok(key.sign(message))
    }

    /// Public key of an actor, as `did:key`.
    pub async fn actor_did_key(&self, did: &Did) -> CryptoResult<String> {
        Ok(did_key(&self.signing_key(did).await?.verifying_key()))
    }

    /// Sign a directory operation with the KMS-held rotation key.
    ///
    /// The KMS returns DER; the result is converted to 64-byte compact
    /// `R‖S` with `S` normalised to low-S.
    pub async fn sign_for_directory(&self, op_bytes: &[u8]) -> CryptoResult<Signature> {
        let der = self
            .kms
            .sign(&self.config.directory_key_alias, op_bytes)
            .await?;
        Signature::from_der(&der)
    }

    /// Directory rotation key as `did:key`.
    pub async fn directory_did_key(&self) -> CryptoResult<String> {
        let key = self
            .kms
            .public_key(&self.config.directory_key_alias)
            .await?;
        Ok(did_key(&key))
    }

    /// Evict both cached forms of an actor's key.
    pub fn invalidate_keys(&self, did: &Did) {
        let mut caches = self.caches.lock().expect("lock poisoned");
        caches.encrypted.remove(did);
        caches.signing.remove(did);
        debug!(did = %did, "invalidated cached keys");
    }

    /// Delete the persisted ciphertext and evict caches.
    pub async fn delete_key(&self, did: &Did) -> CryptoResult<()> {
        self.invalidate_keys(did);
        self.keystore.delete(&Self::keystore_path(did)).await?;
        Ok(())
    }

    /// Drop cache entries past their expiry. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut caches = self.caches.lock().expect("lock poisoned");
        let before = caches.encrypted.len() + caches.signing.len();
        caches.encrypted.retain(|_, c| c.expires_at > now);
        caches.signing.retain(|_, c| c.expires_at > now);
        let evicted = before - (caches.encrypted.len() + caches.signing.len());
        if evicted > 0 {
            debug!(evicted, "evicted expired key cache entries");
        }
        evicted
    }

    /// Stop the expiry task and wait for it to exit.
    pub async fn flush(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// `(encrypted, signing)` cache sizes.
    pub fn cache_sizes(&self) -> (usize, usize) {
        let caches = self.caches.lock().expect("lock poisoned");
        (caches.encrypted.len(), caches.signing.len())
    }

    async fn signing_key(&self, did: &Did) -> CryptoResult<Arc<SigningKey>> {
        let now = Instant::now();
        let cached_ciphertext = {
            let caches = self.caches.lock().expect("lock poisoned");
            if let Some(cached) = caches.signing.get(did).filter(|c| c.expires_at > now) {
                return Ok(cached.key.clone());
            }
            caches
                .encrypted
                .get(did)
                .filter(|c| c.expires_at > now)
                .map(|c| c.ciphertext.clone())
        };

        let ciphertext = match cached_ciphertext {
            Some(ct) => ct,
            None => {
                let ct = match self.keystore.get(&Self::keystore_path(did)).await {
                    Ok(ct) => ct.to_vec(),
                    Err(StoreError::ObjectNotFound(_)) => {
                        return Err(CryptoError::NoSigningKey(did.clone()))
                    }
                    Err(e) => return Err(e.into()),
                };
                self.caches.lock().expect("lock poisoned").encrypted.insert(
                    did.clone(),
                    CachedCiphertext {
                        ciphertext: ct.clone(),
                        expires_at: Instant::now() + self.config.encrypted_ttl,
                    },
                );
                ct
            }
        };

        let plaintext = self
            .kms
            .decrypt(&ciphertext, &actor_context(did.as_str()))
            .await?;
        let key = Arc::new(SigningKey::from_bytes(&plaintext)?);
        self.caches.lock().expect("lock poisoned").signing.insert(
            did.clone(),
            CachedKey {
                key: key.clone(),
                expires_at: Instant::now() + self.config.signing_ttl,
            },
        );
        debug!(did = %did, "decrypted signing key");
        Ok(key)
    }
}

#[async_trait]
impl CommitSigner for KeyManager {
    async fn sign(&self, did: &Did, bytes: &[u8]) -> CryptoResult<Signature> {
        self.sign_for_actor(did, bytes).await
    }
}

#[async_trait]
impl SigningKeyResolver for KeyManager {
    async fn resolve(&self, did: &Did) -> CryptoResult<VerifyingKey> {
        Ok(self.signing_key(did).await?.verifying_key())
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalKms;
    use civpds_store::MemObjectStorage;

    fn setup(config: KeyManagerConfig) -> (Arc<KeyManager>, Arc<MemObjectStorage>) {
        let kms = LocalKms::new();
        kms.add_master_key(&config.actor_key_alias, [9u8; 32]);
        kms.generate_signing_key(&config.directory_key_alias);
        let store = Arc::new(MemObjectStorage::new());
        let manager = KeyManager::new(Arc::new(kms), store.clone(), config);
        (manager, store)
    }

    fn did(s: &str) -> Did {
        Did::parse(s).unwrap()
    }

    #[tokio::test]
    async fn create_then_sign() {
        let (km, store) = setup(KeyManagerConfig::default());
        let d = did("did:plc:aaa");
        let key = KeyManager::create_signing_key();
        let public = key.verifying_key();
        km.create_encrypted_key(&d, key).await.unwrap();

        assert_eq!(store.content_type("did:plc:aaa.kms").as_deref(), Some(OCTET_STREAM));
        let sig = km.sign_for_actor(&d, b"commit bytes").await.unwrap();
        assert!(public.verify(b"commit bytes", &sig).is_ok());
        km.flush().await;
    }

    #[tokio::test]
    async fn unknown_did_has_no_signing_key() {
        let (km, _) = setup(KeyManagerConfig::default());
        let err = km.sign_for_actor(&did("did:plc:nobody"), b"x").await.unwrap_err();
        assert!(matches!(err, CryptoError::NoSigningKey(_)));
        km.flush().await;
    }

    #[tokio::test]
    async fn invalidated_key_reloads_from_keystore() {
        let (km, _) = setup(KeyManagerConfig::default());
        let d = did("did:plc:aaa");
        let key = KeyManager::create_signing_key();
        let public = key.verifying_key();
        km.create_encrypted_key(&d, key).await.unwrap();

        km.invalidate_keys(&d);
        assert_eq!(km.cache_sizes(), (0, 0));
        let sig = km.sign_for_actor(&d, b"again").await.unwrap();
        assert!(public.verify(b"again", &sig).is_ok());
        assert_eq!(km.cache_sizes(), (1, 1));
        km.flush().await;
    }

    #[tokio::test]
    async fn ciphertext_moved_to_other_did_fails_to_decrypt() {
        let (km, store) = setup(KeyManagerConfig::default());
        let a = did("did:plc:aaa");
        let b = did("did:plc:bbb");
        km.create_encrypted_key(&a, KeyManager::create_signing_key())
            .await
            .unwrap();
        let ct = store.get("did:plc:aaa.kms").await.unwrap();
        store.put("did:plc:bbb.kms", ct, OCTET_STREAM).await.unwrap();

        let err = km.sign_for_actor(&b, b"x").await.unwrap_err();
        assert!(matches!(err, CryptoError::Kms(_)));
        km.flush().await;
    }

    #[tokio::test(start_paused = true)]
    async fn signing_cache_expires_before_ciphertext_cache() {
        let config = KeyManagerConfig {
            signing_ttl: Duration::from_secs(10),
            encrypted_ttl: Duration::from_secs(100),
            sweep_interval: Duration::from_secs(30),
            ..KeyManagerConfig::default()
        };
        let (km, _) = setup(config);
        let d = did("did:plc:aaa");
        km.create_encrypted_key(&d, KeyManager::create_signing_key())
            .await
            .unwrap();
        assert_eq!(km.cache_sizes(), (1, 1));

        tokio::time::advance(Duration::from_secs(31)).await;
        km.evict_expired();
        assert_eq!(km.cache_sizes(), (1, 0));

        // lazily decrypted from the surviving ciphertext
        km.sign_for_actor(&d, b"x").await.unwrap();
        assert_eq!(km.cache_sizes(), (1, 1));
        km.flush().await;
    }

    #[tokio::test]
    async fn directory_signatures_are_low_s_and_verifiable() {
        let (km, _) = setup(KeyManagerConfig::default());
        let sig = km.sign_for_directory(b"plc op").await.unwrap();
        assert!(sig.is_low_s());
        let key = crate::keys::parse_did_key(&km.directory_did_key().await.unwrap()).unwrap();
        assert!(key.verify(b"plc op", &sig).is_ok());
        km.flush().await;
    }

    #[tokio::test]
    async fn flush_is_idempotent() {
        let (km, _) = setup(KeyManagerConfig::default());
        km.flush().await;
        km.flush().await;
    }
}
