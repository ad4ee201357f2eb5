use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use k256::ecdsa::signature::Signer;
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::VerifyingKey;

const NONCE_LEN: usize = 12;

/// Key/value pairs bound to a ciphertext as additional authenticated data.
///
/// Actor keys are encrypted with `{did -> did}` so a ciphertext copied onto
/// another actor's path fails to decrypt.
pub type EncryptionContext = BTreeMap<String, String>;

/// Build the context used for an actor's signing key.
pub fn actor_context(did: &str) -> EncryptionContext {
    BTreeMap::from([(did.to_string(), did.to_string())])
}

/// Key management service.
///
/// Master keys never leave the KMS. Errors are reported as
/// [`CryptoError::Kms`] and passed through by callers unchanged.
#[async_trait]
pub trait Kms: Send + Sync {
    /// Encrypt `plaintext` under the master key `alias`.
    async fn encrypt(
        &self,
        alias: &str,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> CryptoResult<Vec<u8>>;

    /// Decrypt a ciphertext produced by [`Kms::encrypt`]. The context must
    /// match the one used on encryption.
    async fn decrypt(&self, ciphertext: &[u8], context: &EncryptionContext) -> CryptoResult<Vec<u8>>;

    /// ECDSA-SHA-256 signature by the asymmetric key `alias`, DER encoded.
    async fn sign(&self, alias: &str, message: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Public half of the asymmetric key `alias`.
    async fn public_key(&self, alias: &str) -> CryptoResult<VerifyingKey>;
}

/// In-process KMS backed by AES-256-GCM master keys and secp256k1 signing
/// keys held in memory.
///
/// Ciphertext layout: `[alias len u8][alias][nonce 12][aes-gcm output]`.
pub struct LocalKms {
    master_keys: RwLock<HashMap<String, [u8; 32]>>,
    signing_keys: RwLock<HashMap<String, k256::ecdsa::SigningKey>>,
}

impl LocalKms {
    pub fn new() -> Self {
        Self {
            master_keys: RwLock::new(HashMap::new()),
            signing_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Register a symmetric master key.
    pub fn add_master_key(&self, alias: &str, key: [u8; 32]) {
        self.master_keys
            .write()
            .expect("lock poisoned")
            .insert(alias.to_string(), key);
    }

    /// Register an asymmetric signing key from its raw secret bytes.
    pub fn add_signing_key(&self, alias: &str, secret: &[u8]) -> CryptoResult<()> {
        let key = k256::ecdsa::SigningKey::from_slice(secret)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        self.signing_keys
            .write()
            .expect("lock poisoned")
            .insert(alias.to_string(), key);
        Ok(())
    }

    /// Register a freshly generated asymmetric signing key.
    pub fn generate_signing_key(&self, alias: &str) {
        let key = k256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        self.signing_keys
            .write()
            .expect("lock poisoned")
            .insert(alias.to_string(), key);
    }

    fn master_key(&self, alias: &str) -> CryptoResult<[u8; 32]> {
        self.master_keys
            .read()
            .expect("lock poisoned")
            .get(alias)
            .copied()
            .ok_or_else(|| CryptoError::Kms(format!("unknown master key alias {alias:?}")))
    }
}

impl Default for LocalKms {
    fn default() -> Self {
        Self::new()
    }
}

fn aad(context: &EncryptionContext) -> Vec<u8> {
    let mut out = Vec::new();
    for (k, v) in context {
        out.extend_from_slice(k.as_bytes());
        out.push(b'=');
        out.extend_from_slice(v.as_bytes());
        out.push(b'\n');
    }
    out
}

#[async_trait]
impl Kms for LocalKms {
    async fn encrypt(
        &self,
        alias: &str,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> CryptoResult<Vec<u8>> {
        if alias.len() > u8::MAX as usize {
            return Err(CryptoError::Kms("alias too long".into()));
        }
        let key = self.master_key(alias)?;
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| CryptoError::Kms(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let aad = aad(context);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Kms("encryption failed".into()))?;

        let mut out = Vec::with_capacity(1 + alias.len() + NONCE_LEN + sealed.len());
        out.push(alias.len() as u8);
        out.extend_from_slice(alias.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8], context: &EncryptionContext) -> CryptoResult<Vec<u8>> {
        let malformed = || CryptoError::Kms("malformed ciphertext".into());
        let (&alias_len, rest) = ciphertext.split_first().ok_or_else(malformed)?;
        let alias_len = alias_len as usize;
        if rest.len() < alias_len + NONCE_LEN {
            return Err(malformed());
        }
        let alias = std::str::from_utf8(&rest[..alias_len]).map_err(|_| malformed())?;
        let nonce = &rest[alias_len..alias_len + NONCE_LEN];
        let sealed = &rest[alias_len + NONCE_LEN..];

        let key = self.master_key(alias)?;
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| CryptoError::Kms(e.to_string()))?;
        let aad = aad(context);
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Kms("decryption failed: ciphertext or context mismatch".into()))
    }

    async fn sign(&self, alias: &str, message: &[u8]) -> CryptoResult<Vec<u8>> {
        let keys = self.signing_keys.read().expect("lock poisoned");
        let key = keys
            .get(alias)
            .ok_or_else(|| CryptoError::Kms(format!("unknown signing key alias {alias:?}")))?;
        let sig: k256::ecdsa::Signature = key.sign(message);
        Ok(sig.to_der().as_bytes().to_vec())
    }

    async fn public_key(&self, alias: &str) -> CryptoResult<VerifyingKey> {
        let keys = self.signing_keys.read().expect("lock poisoned");
        let key = keys
            .get(alias)
            .ok_or_else(|| CryptoError::Kms(format!("unknown signing key alias {alias:?}")))?;
        VerifyingKey::from_sec1_bytes(key.verifying_key().to_encoded_point(true).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Signature;

    fn kms() -> LocalKms {
        let kms = LocalKms::new();
        kms.add_master_key("actor-master", [7u8; 32]);
        kms.generate_signing_key("directory");
        kms
    }

    #[tokio::test]
    async fn encrypt_decrypt_with_matching_context() {
        let kms = kms();
        let ctx = actor_context("did:plc:aaa");
        let ct = kms.encrypt("actor-master", b"secret", &ctx).await.unwrap();
        assert_ne!(&ct[..], b"secret");
        assert_eq!(kms.decrypt(&ct, &ctx).await.unwrap(), b"secret");
    }

    #[tokio::test]
    async fn context_is_bound_to_ciphertext() {
        let kms = kms();
        let ct = kms
            .encrypt("actor-master", b"secret", &actor_context("did:plc:aaa"))
            .await
            .unwrap();
        let err = kms
            .decrypt(&ct, &actor_context("did:plc:bbb"))
            .await
            .unwrap_err();
        assert!(matches!(err, CryptoError::Kms(_)));
    }

    #[tokio::test]
    async fn unknown_alias_is_a_kms_error() {
        let kms = kms();
        let err = kms
            .encrypt("missing", b"x", &EncryptionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CryptoError::Kms(_)));
        assert!(kms.decrypt(b"", &EncryptionContext::new()).await.is_err());
    }

    #[tokio::test]
    async fn sign_returns_der_verifiable_by_public_key() {
        let kms = kms();
        let der = kms.sign("directory", b"op bytes").await.unwrap();
        let sig = Signature::from_der(&der).unwrap();
        let pk = kms.public_key("directory").await.unwrap();
        assert!(pk.verify(b"op bytes", &sig).is_ok());
    }
}
