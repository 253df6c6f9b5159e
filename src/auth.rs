// =============================================================================
// AUTH MODULE
// =============================================================================
// Resolves the acting user from a bearer token. The token is issued by the
// identity provider in front of the database; its `sub` claim is the user id
// recorded on every stock movement.
//
// Handlers take `Option<Session>`: a missing or invalid token yields `None`
// and the adjustment path reports it as unauthenticated before any call is
// made.
// =============================================================================

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adjustment::AdjustmentError;
use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
    pub aud: String,
}

#[derive(Clone)]
pub struct SessionVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl SessionVerifier {
    pub fn new(secret: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// `None` for any token that does not verify; the reason is only logged.
    pub fn verify(&self, token: &str) -> Option<Session> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Some(Session {
                user_id: data.claims.sub,
            }),
            Err(err) => {
                tracing::debug!(error = %err, "Rejected session token");
                None
            }
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Session {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        bearer_token(&parts.headers)
            .and_then(|token| state.sessions.verify(token))
            .ok_or(AppError::Adjustment(AdjustmentError::Unauthenticated))
    }
}
