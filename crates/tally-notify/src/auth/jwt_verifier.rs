//! JWT session-token verification.
//!
//! # Configuration
//!
//! The gateway reads the HMAC secret the auth provider signs session tokens
//! with from `--jwt-secret` / `TALLY_JWT_SECRET`.
//!
//! # Claims
//!
//! - `sub`: user identifier (required)
//! - `exp`: expiration, Unix seconds (required)
//! - `email`, `role`, `iss`, `aud`, `iat`: optional
//!
//! ```json
//! {
//!   "sub": "8f14e45f-ceea-467f-a0e6-7a5b2c6f1d2e",
//!   "email": "cashier@example.com",
//!   "role": "authenticated",
//!   "aud": "authenticated",
//!   "exp": 1790000000
//! }
//! ```

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::{strip_bearer, AuthError, TokenVerifier, UserIdentity};

/// JWT claims structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user identifier).
    pub sub: String,

    /// Expiration time (Unix timestamp).
    pub exp: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Issued at time (Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// JWT verifier configuration.
#[derive(Clone)]
struct JwtConfig {
    algorithm: Algorithm,
    required_issuer: Option<String>,
    required_audience: Option<String>,
    /// Leeway in seconds for expiration check.
    leeway_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::HS256,
            required_issuer: None,
            required_audience: None,
            leeway_secs: 60,
        }
    }
}

/// Verifies HMAC-signed JWTs and maps `sub` to the user id.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    config: JwtConfig,
}

impl JwtVerifier {
    /// Create a verifier with an HMAC secret.
    pub fn with_secret(secret: &[u8]) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            config: JwtConfig::default(),
        }
    }

    /// Create a verifier with an HMAC secret string.
    pub fn with_secret_str(secret: &str) -> Self {
        Self::with_secret(secret.as_bytes())
    }

    /// Set the required issuer for validation.
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.config.required_issuer = Some(issuer.into());
        self
    }

    /// Set the required audience for validation.
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.config.required_audience = Some(audience.into());
        self
    }

    /// Set the leeway for expiration check.
    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.config.leeway_secs = secs;
        self
    }

    /// Verify a token and extract its claims.
    pub fn verify_token(&self, token: &str) -> Result<JwtClaims, AuthError> {
        let token = strip_bearer(token);
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let mut validation = Validation::new(self.config.algorithm);
        validation.leeway = self.config.leeway_secs;

        if let Some(ref iss) = self.config.required_issuer {
            validation.set_issuer(&[iss]);
        }

        match self.config.required_audience {
            Some(ref aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let token_data = decode::<JwtClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(token_data.claims)
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        let claims = self.verify_token(token)?;
        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("token has no subject".to_string()));
        }

        Ok(UserIdentity {
            user_id: claims.sub,
            email: claims.email,
        })
    }
}
