//! Error taxonomy for command handling.
//!
//! Every handler failure maps onto one of the wire status codes. Internal
//! errors keep their detail server-side; the wire only ever sees a generic
//! message for those.

use weft_sdk::protocol;
use weft_sdk::token::TokenError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Malformed or missing arguments.
    #[error("{0}")]
    BadRequest(String),
    /// Token failed, required token missing, or owner mismatch.
    #[error("{0}")]
    Unauthorized(String),
    /// Authenticated but role insufficient.
    #[error("{0}")]
    Forbidden(String),
    /// Session or row not found (or permanently retired).
    #[error("{0}")]
    NotFound(String),
    /// Infrastructure failure; detail is logged, not surfaced.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::BadRequest(_) => protocol::STATUS_BAD_REQUEST,
            RelayError::Unauthorized(_) => protocol::STATUS_UNAUTHORIZED,
            RelayError::Forbidden(_) => protocol::STATUS_FORBIDDEN,
            RelayError::NotFound(_) => protocol::STATUS_NOT_FOUND,
            RelayError::Internal(_) => protocol::STATUS_INTERNAL,
        }
    }

    /// Message safe to put on the wire.
    pub fn public_message(&self) -> String {
        match self {
            RelayError::Internal(e) => {
                tracing::error!(error = %e, "internal error in command handler");
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        RelayError::Internal(anyhow::Error::new(e))
    }
}

impl From<TokenError> for RelayError {
    // Registry unavailability and forgery are indistinguishable at this
    // layer; both surface as 401.
    fn from(e: TokenError) -> Self {
        RelayError::Unauthorized(e.to_string())
    }
}
