//! Key management for the civic PDS.
//!
//! Per-actor secp256k1 signing keys are envelope-encrypted under a KMS
//! master key and persisted to object storage. The [`KeyManager`] caches
//! ciphertexts and decrypted keys with separate lifetimes and signs commit
//! bytes on behalf of actors. A distinct directory rotation key, held only
//! by the KMS, signs PLC operations.
//!
//! Actors hosted elsewhere are verified against the `atproto` key their
//! directory entry advertises; [`DirectoryKeyResolver`] tries local keys
//! first and falls back to the directory.
//!
//! All primitive crypto comes from `k256` and `aes-gcm`; nothing here is
//! custom cryptography.

pub mod directory;
pub mod error;
pub mod keys;
pub mod kms;
pub mod manager;
pub mod plc;
pub mod resolver;

pub use directory::{HttpDirectory, DEFAULT_PLC_URL};
pub use error::{CryptoError, CryptoResult};
pub use keys::{did_key, parse_did_key, Signature, SigningKey, VerifyingKey};
pub use kms::{EncryptionContext, Kms, LocalKms};
pub use manager::{KeyManager, KeyManagerConfig};
pub use plc::{DirectoryClient, DirectoryOp, MemDirectory, PlcOperation, PlcService, PlcTombstone};
pub use resolver::{
    CommitSigner, DirectoryKeyResolver, LocalSigner, MemKeyResolver, SigningKeyResolver,
};
