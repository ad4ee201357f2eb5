use k256::ecdsa::signature::{Signer, Verifier};

use crate::error::{CryptoError, CryptoResult};

/// Multicodec prefix for a secp256k1 compressed public key.
const SECP256K1_PUB_MULTICODEC: [u8; 2] = [0xe7, 0x01];
const DID_KEY_PREFIX: &str = "did:key:z";

/// Curve order N of secp256k1, big-endian.
const CURVE_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
    0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
];

/// N / 2, big-endian.
const HALF_ORDER: [u8; 32] = [
    0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0x5d, 0x57, 0x6e, 0x73, 0x57, 0xa4, 0x50, 0x1d, 0xdf, 0xe9, 0x2f, 0x46, 0x68, 0x1b, 0x20, 0xa0,
];

/// secp256k1 signing key (private).
pub struct SigningKey(k256::ecdsa::SigningKey);

/// secp256k1 verifying key (public).
#[derive(Clone, PartialEq, Eq)]
pub struct VerifyingKey(k256::ecdsa::VerifyingKey);

/// 64-byte compact `R‖S` signature with `S` in low-S form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl SigningKey {
    /// Draw a fresh key from the CSPRNG.
    pub fn generate() -> Self {
        Self(k256::ecdsa::SigningKey::random(&mut rand::thread_rng()))
    }

    /// Create from a raw 32-byte secret scalar.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        k256::ecdsa::SigningKey::from_slice(bytes)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Raw secret scalar bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0.to_bytes());
        out
    }

    /// The corresponding public key.
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key().clone())
    }

    /// ECDSA-SHA-256 over `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig: k256::ecdsa::Signature = self.0.sign(message);
        Signature::from_rs(sig.to_bytes().as_slice())
    }

    /// `did:key` form of the public key.
    pub fn did_key(&self) -> String {
        did_key(&self.verifying_key())
    }
}

impl VerifyingKey {
    /// Parse a SEC1 public key (compressed or uncompressed).
    pub fn from_sec1_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        k256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// 33-byte compressed SEC1 encoding.
    pub fn to_compressed(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    /// Verify a compact signature over `message`. High-S signatures are
    /// rejected.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        if !signature.is_low_s() {
            return Err(CryptoError::InvalidSignature);
        }
        let sig = k256::ecdsa::Signature::from_slice(&signature.0)
            .map_err(|_| CryptoError::InvalidSignature)?;
        self.0
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl Signature {
    /// Wrap 64 compact bytes as received on the wire. `S` must already be
    /// in low-S form.
    pub fn from_compact(bytes: &[u8]) -> CryptoResult<Self> {
        let Ok(raw) = <[u8; 64]>::try_from(bytes) else {
            return Err(CryptoError::InvalidSignature);
        };
        let sig = Self(raw);
        if !sig.is_low_s() {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(sig)
    }

    /// Convert an ASN.1 DER ECDSA signature (as returned by a KMS) into
    /// compact low-S form.
    pub fn from_der(der: &[u8]) -> CryptoResult<Self> {
        let sig = k256::ecdsa::Signature::from_der(der).map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self::from_rs(sig.to_bytes().as_slice()))
    }

    fn from_rs(rs: &[u8]) -> Self {
        let mut out = [0u8; 64];
        out.copy_from_slice(&rs[..64]);
        let mut s = [0u8; 32];
        s.copy_from_slice(&out[32..]);
        if s > HALF_ORDER {
            out[32..].copy_from_slice(&sub_be(&CURVE_ORDER, &s));
        }
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Returns `true` if `S ≤ N/2`.
    pub fn is_low_s(&self) -> bool {
        self.0[32..] <= HALF_ORDER[..]
    }
}

/// `a - b` for 256-bit big-endian integers with `a ≥ b`.
fn sub_be(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let mut d = a[i] as i16 - b[i] as i16 - borrow;
        if d < 0 {
            d += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        out[i] = d as u8;
    }
    out
}

/// Encode a public key as `did:key:z<base58btc(0xe7 0x01 ‖ compressed)>`.
pub fn did_key(key: &VerifyingKey) -> String {
    let mut bytes = SECP256K1_PUB_MULTICODEC.to_vec();
    bytes.extend_from_slice(&key.to_compressed());
    format!("{DID_KEY_PREFIX}{}", bs58::encode(bytes).into_string())
}

/// Parse a secp256k1 `did:key`.
pub fn parse_did_key(s: &str) -> CryptoResult<VerifyingKey> {
    let encoded = s
        .strip_prefix(DID_KEY_PREFIX)
        .ok_or_else(|| CryptoError::InvalidDidKey(s.to_string()))?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| CryptoError::InvalidDidKey(s.to_string()))?;
    match bytes.strip_prefix(&SECP256K1_PUB_MULTICODEC[..]) {
        Some(key) => VerifyingKey::from_sec1_bytes(key),
        None => Err(CryptoError::InvalidDidKey(s.to_string())),
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey(<redacted>)")
    }
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerifyingKey({})", hex::encode(self.to_compressed()))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sign_and_verify() {
        let sk = SigningKey::generate();
        let sig = sk.sign(b"hello world");
        assert!(sk.verifying_key().verify(b"hello world", &sig).is_ok());
        assert!(sig.is_low_s());
    }

    #[test]
    fn verify_fails_on_wrong_message_or_key() {
        let sk = SigningKey::generate();
        let other = SigningKey::generate();
        let sig = sk.sign(b"message");
        assert!(sk.verifying_key().verify(b"massage", &sig).is_err());
        assert!(other.verifying_key().verify(b"message", &sig).is_err());
    }

    #[test]
    fn from_bytes_roundtrip() {
        let sk = SigningKey::generate();
        let sk2 = SigningKey::from_bytes(&sk.to_bytes()).unwrap();
        assert_eq!(sk.verifying_key(), sk2.verifying_key());
        assert!(SigningKey::from_bytes(&[0u8; 32]).is_err());
    }

    /// `sig` with S replaced by N - S: the same point, but high-S.
    fn malleate(sig: &Signature) -> [u8; 64] {
        let mut high = *sig.as_bytes();
        let mut s = [0u8; 32];
        s.copy_from_slice(&high[32..]);
        high[32..].copy_from_slice(&sub_be(&CURVE_ORDER, &s));
        high
    }

    #[test]
    fn high_s_compact_signature_is_rejected() {
        let sk = SigningKey::generate();
        let sig = sk.sign(b"payload");
        let high = malleate(&sig);
        assert!(high[32..] > HALF_ORDER[..]);

        assert!(matches!(
            Signature::from_compact(&high),
            Err(CryptoError::InvalidSignature)
        ));
        // a high-S value that bypasses decoding still fails verification
        let forged = Signature(high);
        assert!(matches!(
            sk.verifying_key().verify(b"payload", &forged),
            Err(CryptoError::InvalidSignature)
        ));
        assert_eq!(Signature::from_compact(sig.as_bytes()).unwrap(), sig);
    }

    #[test]
    fn high_s_der_signature_is_normalised() {
        let sk = SigningKey::generate();
        let sig = sk.sign(b"payload");
        let high = malleate(&sig);
        let der = k256::ecdsa::Signature::from_slice(&high).unwrap().to_der();
        let normalised = Signature::from_der(der.as_bytes()).unwrap();
        assert_eq!(normalised, sig);
        assert!(sk.verifying_key().verify(b"payload", &normalised).is_ok());
    }

    #[test]
    fn der_signatures_convert_to_compact() {
        let inner = k256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let sig: k256::ecdsa::Signature = inner.sign(b"op");
        let der = sig.to_der();
        let compact = Signature::from_der(der.as_bytes()).unwrap();
        assert!(compact.is_low_s());
        let vk = VerifyingKey(inner.verifying_key().clone());
        assert!(vk.verify(b"op", &compact).is_ok());
        assert!(Signature::from_der(b"not der").is_err());
    }

    #[test]
    fn did_key_roundtrip() {
        let sk = SigningKey::generate();
        let encoded = sk.did_key();
        assert!(encoded.starts_with("did:key:zQ3s"));
        assert_eq!(parse_did_key(&encoded).unwrap(), sk.verifying_key());
        assert!(parse_did_key("did:key:z6Mk").is_err());
        assert!(parse_did_key("did:plc:abc").is_err());
    }

    #[test]
    fn debug_redacts_signing_key() {
        let sk = SigningKey::generate();
        assert!(format!("{sk:?}").contains("redacted"));
    }

    proptest! {
        #[test]
        fn every_signature_is_low_s(msg in proptest::collection::vec(any::<u8>(), 0..256)) {
            let sk = SigningKey::generate();
            let sig = sk.sign(&msg);
            prop_assert!(sig.is_low_s());
            prop_assert!(sk.verifying_key().verify(&msg, &sig).is_ok());
        }

        #[test]
        fn parse_did_key_never_panics(s in "\\PC{0,64}") {
            let _ = parse_did_key(&s);
        }
    }
}
