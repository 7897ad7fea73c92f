//! Session-token verification.
//!
//! Subscription endpoints resolve a bearer token to the user it was issued
//! for through a [`TokenVerifier`]. The bundled implementation checks JWTs
//! signed with a shared secret, which is what the hosted auth provider
//! issues to the front end.

mod jwt_verifier;

pub use jwt_verifier::{JwtClaims, JwtVerifier};

use thiserror::Error;

/// Authentication failures. Always surfaced as 401 and never retried.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no token provided")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// The user a token was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub email: Option<String>,
}

/// Resolves a bearer token to a user.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

/// Strip an optional `Bearer ` prefix.
pub fn strip_bearer(token: &str) -> &str {
    token
        .strip_prefix("Bearer ")
        .or_else(|| token.strip_prefix("bearer "))
        .unwrap_or(token)
        .trim()
}
