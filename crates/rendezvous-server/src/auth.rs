//! Identity verification for incoming connections.

use async_trait::async_trait;
use thiserror::Error;

/// Verification failures. All of them reject the upgrade with 401.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,

    #[error("Token rejected: {0}")]
    Rejected(String),
}

/// Resolves a client token to a stable identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify `token` and return the identity it names.
    async fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// Treats the token itself as the identity.
///
/// Suitable for test deployments where clients are trusted to name
/// themselves.
#[derive(Debug, Default)]
pub struct TokenIdentityVerifier;

#[async_trait]
impl IdentityVerifier for TokenIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        let identity = token.trim();
        if identity.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if identity.chars().any(char::is_control) {
            return Err(AuthError::Rejected("control characters".into()));
        }
        Ok(identity.to_string())
    }
}
