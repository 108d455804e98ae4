//! `did:key` helpers for ed25519 keys.
//!
//! A `did:key` DID embeds the public key directly: `did:key:z` followed by
//! base58btc of the multicodec prefix `0xed 0x01` and the 32 raw key bytes.
//! Everywhere else in the system DIDs are opaque strings; only token
//! verification needs to decode one back into a verifying key.

use ed25519_dalek::{SigningKey, VerifyingKey};

/// Multicodec prefix for ed25519 public keys.
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

#[derive(Debug, thiserror::Error)]
pub enum DidError {
    #[error("not a did:key DID: {0}")]
    NotDidKey(String),
    #[error("invalid multibase encoding")]
    InvalidMultibase,
    #[error("not an ed25519 key")]
    NotEd25519,
}

/// Encode an ed25519 verifying key as a `did:key` DID.
pub fn encode_did(key: &VerifyingKey) -> String {
    format!(
        "did:key:z{}",
        bs58::encode([&ED25519_MULTICODEC[..], key.as_bytes()].concat()).into_string()
    )
}

/// Decode a `did:key` DID back into an ed25519 verifying key.
pub fn decode_did(did: &str) -> Result<VerifyingKey, DidError> {
    let encoded = did
        .strip_prefix("did:key:z")
        .ok_or_else(|| DidError::NotDidKey(did.to_string()))?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| DidError::InvalidMultibase)?;
    let key_bytes = bytes
        .strip_prefix(&ED25519_MULTICODEC[..])
        .ok_or(DidError::NotEd25519)?;
    let key_bytes: &[u8; 32] = key_bytes.try_into().map_err(|_| DidError::NotEd25519)?;
    VerifyingKey::from_bytes(key_bytes).map_err(|_| DidError::NotEd25519)
}

/// An ed25519 keypair together with its `did:key` DID.
///
/// Owners hold a stable one; session DIDs are generated fresh per session.
pub struct KeyPair {
    pub signing: SigningKey,
    pub did: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let did = encode_did(&signing.verifying_key());
        Self { signing, did }
    }

    pub fn verifying(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }
}
