//! Capability token verification for the two relay roles.
//!
//! Owner tokens prove the bearer controls a document: rooted at the owner
//! DID recorded in the on-chain registry, scoped to the contract address.
//! Collaboration tokens prove an invitation: rooted at the session's
//! ephemeral DID. Both are audience-bound to this server's DID.

use std::sync::Arc;

use weft_sdk::token::{Capability, CapabilityToken, TokenExpectations};

use crate::error::RelayError;
use crate::registry::OwnerRegistry;

/// Capability an owner token must carry.
pub const CAN_CREATE: &str = "collaboration.CREATE";
/// Capability a collaboration token must carry.
pub const CAN_COLLABORATE: &str = "collaboration.COLLABORATE";

const SCHEME_STORAGE: &str = "storage";
const RESOURCE_COLLABORATION: &str = "collaboration";

pub struct TokenVerifier {
    server_did: String,
    registry: Arc<dyn OwnerRegistry>,
}

impl TokenVerifier {
    pub fn new(server_did: &str, registry: Arc<dyn OwnerRegistry>) -> Self {
        Self {
            server_did: server_did.to_string(),
            registry,
        }
    }

    /// Verify an owner token. Returns the owner DID resolved from the
    /// registry; any failure — forgery, wrong scope, or a registry that
    /// cannot answer — is a 401.
    pub async fn verify_owner_token(
        &self,
        token: &str,
        contract_address: &str,
        collaborator_address: &str,
    ) -> Result<String, RelayError> {
        let owner_did = self
            .registry
            .owner_did(contract_address, collaborator_address)
            .await
            .ok_or_else(|| RelayError::Unauthorized("owner not found in registry".into()))?;

        let token = CapabilityToken::decode(token)?;
        token.verify(&TokenExpectations {
            audience: self.server_did.clone(),
            capability: Capability::new(
                SCHEME_STORAGE,
                &contract_address.to_lowercase(),
                CAN_CREATE,
            ),
            root_issuer: owner_did.clone(),
        })?;

        Ok(owner_did)
    }

    /// Verify a collaboration token against the session's ephemeral DID.
    pub fn verify_collaboration_token(
        &self,
        token: &str,
        session_did: &str,
    ) -> Result<(), RelayError> {
        let token = CapabilityToken::decode(token)?;
        token.verify(&TokenExpectations {
            audience: self.server_did.clone(),
            capability: Capability::new(SCHEME_STORAGE, RESOURCE_COLLABORATION, CAN_COLLABORATE),
            root_issuer: session_did.to_string(),
        })?;
        Ok(())
    }
}
