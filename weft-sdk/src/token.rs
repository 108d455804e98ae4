//! Capability tokens.
//!
//! A capability token is a signed, audience-scoped grant: its bearer may
//! exercise `capability.can` on `capability.with`, as authorized by the
//! issuer DID. The signature is ed25519 over the JCS-canonical token with
//! an empty signature field; the issuer must be a `did:key` DID so the
//! verifier can recover the public key without a resolver round-trip.
//!
//! On the wire tokens travel as base64url(JSON) strings and are opaque to
//! everything except the verifier.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};

use crate::canonical;
use crate::did;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token encoding invalid: {0}")]
    Encoding(String),
    #[error("issuer DID unusable: {0}")]
    Issuer(#[from] did::DidError),
    #[error("audience mismatch: token is for {0}")]
    Audience(String),
    #[error("capability mismatch")]
    Capability,
    #[error("issuer mismatch: expected {expected}, token rooted at {actual}")]
    RootIssuer { expected: String, actual: String },
    #[error("token expired")]
    Expired,
    #[error("signature verification failed")]
    Signature,
}

/// The resource half of a capability: `{scheme, resource}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub scheme: String,
    pub resource: String,
}

/// A named action on a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub with: Resource,
    pub can: String,
}

impl Capability {
    pub fn new(scheme: &str, resource: &str, can: &str) -> Self {
        Self {
            with: Resource {
                scheme: scheme.to_string(),
                resource: resource.to_string(),
            },
            can: can.to_string(),
        }
    }
}

/// What a verifier requires of a presented token.
#[derive(Debug, Clone)]
pub struct TokenExpectations {
    /// The verifying server's own DID.
    pub audience: String,
    /// Exact capability the operation requires.
    pub capability: Capability,
    /// DID the grant must be rooted at.
    pub root_issuer: String,
}

/// A signed capability grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityToken {
    /// `did:key` DID of the grantor.
    pub issuer: String,
    /// DID of the server this token is addressed to.
    pub audience: String,
    pub capability: Capability,
    /// Expiry as ms since epoch; `None` = non-expiring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// base64url(ed25519 signature) over the JCS-canonical token with this
    /// field empty.
    #[serde(default)]
    pub signature: String,
}

impl CapabilityToken {
    /// Build and sign a token in one step.
    pub fn issue(
        issuer: &did::KeyPair,
        audience: &str,
        capability: Capability,
        expires_at: Option<i64>,
    ) -> Self {
        let mut token = Self {
            issuer: issuer.did.clone(),
            audience: audience.to_string(),
            capability,
            expires_at,
            signature: String::new(),
        };
        token.sign(&issuer.signing);
        token
    }

    /// Sign the token, replacing any existing signature.
    pub fn sign(&mut self, key: &SigningKey) {
        self.signature = String::new();
        let canonical = canonical::canonicalize(self)
            .expect("token serialization is infallible");
        let sig = key.sign(canonical.as_bytes());
        self.signature = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig.to_bytes());
    }

    /// Verify the token against the expectations, checking in order:
    /// issuer key, audience, capability, root issuer, expiry, signature.
    pub fn verify(&self, expect: &TokenExpectations) -> Result<(), TokenError> {
        let verifying_key = did::decode_did(&self.issuer)?;

        if self.audience != expect.audience {
            return Err(TokenError::Audience(self.audience.clone()));
        }
        if self.capability != expect.capability {
            return Err(TokenError::Capability);
        }
        if self.issuer != expect.root_issuer {
            return Err(TokenError::RootIssuer {
                expected: expect.root_issuer.clone(),
                actual: self.issuer.clone(),
            });
        }
        if let Some(expires_at) = self.expires_at {
            if chrono::Utc::now().timestamp_millis() > expires_at {
                return Err(TokenError::Expired);
            }
        }

        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        let canonical = canonical::canonicalize(&unsigned)
            .map_err(|e| TokenError::Encoding(e.to_string()))?;
        let sig_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(|e| TokenError::Encoding(e.to_string()))?;
        let signature = Signature::from_slice(&sig_bytes).map_err(|_| TokenError::Signature)?;
        verifying_key
            .verify(canonical.as_bytes(), &signature)
            .map_err(|_| TokenError::Signature)
    }

    /// Wire encoding: base64url(compact JSON).
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).expect("token serialization is infallible");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a wire token.
    pub fn decode(encoded: &str) -> Result<Self, TokenError> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| TokenError::Encoding(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| TokenError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::did::KeyPair;

    fn expectations(audience: &str, issuer: &str) -> TokenExpectations {
        TokenExpectations {
            audience: audience.to_string(),
            capability: Capability::new("storage", "collaboration", "collaboration.COLLABORATE"),
            root_issuer: issuer.to_string(),
        }
    }

    #[test]
    fn sign_and_verify() {
        let session = KeyPair::generate();
        let server = KeyPair::generate();
        let token = CapabilityToken::issue(
            &session,
            &server.did,
            Capability::new("storage", "collaboration", "collaboration.COLLABORATE"),
            None,
        );
        token.verify(&expectations(&server.did, &session.did)).unwrap();
    }

    #[test]
    fn wire_roundtrip() {
        let session = KeyPair::generate();
        let server = KeyPair::generate();
        let token = CapabilityToken::issue(
            &session,
            &server.did,
            Capability::new("storage", "collaboration", "collaboration.COLLABORATE"),
            Some(chrono::Utc::now().timestamp_millis() + 60_000),
        );
        let decoded = CapabilityToken::decode(&token.encode()).unwrap();
        decoded.verify(&expectations(&server.did, &session.did)).unwrap();
    }

    #[test]
    fn tampered_capability_fails() {
        let session = KeyPair::generate();
        let server = KeyPair::generate();
        let mut token = CapabilityToken::issue(
            &session,
            &server.did,
            Capability::new("storage", "collaboration", "collaboration.COLLABORATE"),
            None,
        );
        token.capability.with.resource = "0xdeadbeef".into();
        let mut expect = expectations(&server.did, &session.did);
        expect.capability.with.resource = "0xdeadbeef".into();
        assert!(matches!(
            token.verify(&expect),
            Err(TokenError::Signature)
        ));
    }

    #[test]
    fn wrong_audience_fails() {
        let session = KeyPair::generate();
        let server = KeyPair::generate();
        let other = KeyPair::generate();
        let token = CapabilityToken::issue(
            &session,
            &other.did,
            Capability::new("storage", "collaboration", "collaboration.COLLABORATE"),
            None,
        );
        assert!(matches!(
            token.verify(&expectations(&server.did, &session.did)),
            Err(TokenError::Audience(_))
        ));
    }

    #[test]
    fn wrong_root_issuer_fails() {
        let session = KeyPair::generate();
        let impostor = KeyPair::generate();
        let server = KeyPair::generate();
        let token = CapabilityToken::issue(
            &impostor,
            &server.did,
            Capability::new("storage", "collaboration", "collaboration.COLLABORATE"),
            None,
        );
        assert!(matches!(
            token.verify(&expectations(&server.did, &session.did)),
            Err(TokenError::RootIssuer { .. })
        ));
    }

    #[test]
    fn wrong_capability_fails() {
        let session = KeyPair::generate();
        let server = KeyPair::generate();
        let token = CapabilityToken::issue(
            &session,
            &server.did,
            Capability::new("storage", "0xabc", "collaboration.CREATE"),
            None,
        );
        assert!(matches!(
            token.verify(&expectations(&server.did, &session.did)),
            Err(TokenError::Capability)
        ));
    }

    #[test]
    fn expired_token_fails() {
        let session = KeyPair::generate();
        let server = KeyPair::generate();
        let token = CapabilityToken::issue(
            &session,
            &server.did,
            Capability::new("storage", "collaboration", "collaboration.COLLABORATE"),
            Some(chrono::Utc::now().timestamp_millis() - 1),
        );
        assert!(matches!(
            token.verify(&expectations(&server.did, &session.did)),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn non_did_key_issuer_fails() {
        let session = KeyPair::generate();
        let server = KeyPair::generate();
        let mut token = CapabilityToken::issue(
            &session,
            &server.did,
            Capability::new("storage", "collaboration", "collaboration.COLLABORATE"),
            None,
        );
        token.issuer = "did:plc:somebody".into();
        let mut expect = expectations(&server.did, &session.did);
        expect.root_issuer = "did:plc:somebody".into();
        assert!(matches!(token.verify(&expect), Err(TokenError::Issuer(_))));
    }
}
