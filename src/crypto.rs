//! Cryptographic primitives for Miniroha
//!
//! Ed25519 signing and verification, base58 wire encodings, the SHA-512
//! content hash, and the canonical JSON form that signing and hashing are
//! defined over.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha512};

/// Wire prefix carried by every serialized public key.
pub const PUBLIC_KEY_PREFIX: &str = "ed25519:";

/// Length of a serialized public key payload in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Length of a serialized private key (keypair bytes) in bytes.
pub const PRIVATE_KEY_SIZE: usize = 64;

/// Length of a detached signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// An Ed25519 keypair used to sign transactions, blocks, and consensus
/// messages.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generates a new random keypair using the OS random number generator.
    pub fn generate() -> Self {
        KeyPair {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Decodes a keypair from its wire form: base58 of the 64-byte keypair
    /// bytes (secret followed by public).
    pub fn from_encoded(encoded: &str) -> Option<Self> {
        let bytes = bs58::decode(encoded).into_vec().ok()?;
        let bytes: [u8; PRIVATE_KEY_SIZE] = bytes.try_into().ok()?;
        let signing_key = SigningKey::from_keypair_bytes(&bytes).ok()?;
        Some(KeyPair { signing_key })
    }

    /// The public key in wire form: `ed25519:` followed by base58 of the
    /// 32-byte key.
    pub fn public_key(&self) -> String {
        encode_public_key(&self.signing_key.verifying_key())
    }

    /// The private key in wire form: base58 of the 64-byte keypair bytes.
    pub fn encoded_private(&self) -> String {
        bs58::encode(self.signing_key.to_keypair_bytes()).into_string()
    }

    /// Signs a message, returning the base58-encoded detached signature.
    pub fn sign(&self, message: &[u8]) -> String {
        let signature = self.signing_key.sign(message);
        bs58::encode(signature.to_bytes()).into_string()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// Encodes a verifying key into its prefixed wire form.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    format!(
        "{}{}",
        PUBLIC_KEY_PREFIX,
        bs58::encode(key.to_bytes()).into_string()
    )
}

/// Decodes a wire-form public key. Returns `None` on a missing prefix, a
/// base58 error, a wrong length, or an invalid curve point.
pub fn decode_public_key(encoded: &str) -> Option<VerifyingKey> {
    let body = encoded.strip_prefix(PUBLIC_KEY_PREFIX)?;
    let bytes = bs58::decode(body).into_vec().ok()?;
    let bytes: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

/// Verifies a detached signature over a message.
///
/// Every failure mode (malformed key prefix, base58 decoding error, wrong
/// lengths, verification failure) yields `false`; this function never errors
/// across the component boundary.
pub fn verify(public_key: &str, signature: &str, message: &[u8]) -> bool {
    let Some(key) = decode_public_key(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = bs58::decode(signature).into_vec() else {
        return false;
    };
    let sig_bytes: [u8; SIGNATURE_SIZE] = match sig_bytes.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify(message, &signature).is_ok()
}

/// Content hash for blocks and transactions: base58 of the 64-byte SHA-512
/// digest.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha512::digest(bytes);
    bs58::encode(digest).into_string()
}

/// Canonical serialization: JSON with object keys in ascending lexicographic
/// order at every nesting level.
///
/// The value is round-tripped through `serde_json::Value`, whose map is a
/// `BTreeMap`, so nested keys come out sorted without further bookkeeping.
/// Two observably-equal values produce identical bytes.
pub fn canonical<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}

/// Convenience for `content_hash(canonical(value))`.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(content_hash(canonical(value)?.as_bytes()))
}
