//! Bearer-token extraction for subscription endpoints.

use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::Deserialize;

use tally_notify::auth::strip_bearer;
use tally_notify::{AuthError, UserIdentity};

use crate::error::AppError;
use crate::AppState;

/// Token passed in the query string. Browser `EventSource` cannot set headers.
#[derive(Debug, Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

/// The caller's identity, or `None` when no verifier is configured.
///
/// With a verifier configured, a missing or invalid token rejects the request
/// with 401 before any subscriber is registered.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<UserIdentity>);

impl MaybeUser {
    pub fn user_id(&self) -> Option<String> {
        self.0.as_ref().map(|identity| identity.user_id.clone())
    }
}

#[async_trait]
impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(verifier) = state.verifier.as_ref() else {
            return Ok(MaybeUser(None));
        };

        let token = bearer_token(parts).ok_or(AuthError::MissingToken)?;
        let identity = verifier.verify(&token).map_err(|e| {
            tracing::debug!(error = %e, "rejected subscription token");
            AppError::from(e)
        })?;

        Ok(MaybeUser(Some(identity)))
    }
}

/// Token from the `Authorization` header, falling back to `?access_token=`.
fn bearer_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| strip_bearer(value).to_string())
        .filter(|token| !token.is_empty());

    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.access_token)
            .filter(|token| !token.is_empty())
    })
}
