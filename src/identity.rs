// src/identity.rs

use crate::{database::UserStore, error::AuthError, models::UserId, state::AppState};
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// An already-verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

/// Turns a bearer token into an [`Identity`]. Runs before any connection is built.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Token claims, named as the account service issues them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "UserID")]
    pub user_id: UserId,
    #[serde(rename = "Email", default)]
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 tokens, with display names resolved through the user store.
pub struct JwtIdentity {
    key: DecodingKey,
    validation: Validation,
    users: Arc<dyn UserStore>,
    claims_fallback: bool,
}

impl JwtIdentity {
    pub fn new(secret: &[u8], users: Arc<dyn UserStore>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            users,
            claims_fallback: false,
        }
    }

    /// Accepts valid tokens for users the store doesn't know, naming them
    /// from the claims. Used when running without a database.
    pub fn with_claims_fallback(mut self) -> Self {
        self.claims_fallback = true;
        self
    }
}

/// Display name for a user known only from their token: the local part of
/// the email, or `user-<id>`.
fn name_from_claims(claims: &Claims) -> String {
    match claims.email.split('@').next() {
        Some(local) if !local.is_empty() => local.to_string(),
        _ => format!("user-{}", claims.user_id),
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentity {
    async fn identify(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)?.claims;
        let username = match self.users.username(claims.user_id).await? {
            Some(name) => name,
            None if self.claims_fallback => name_from_claims(&claims),
            None => return Err(AuthError::UnknownUser(claims.user_id)),
        };
        Ok(Identity {
            user_id: claims.user_id,
            username,
        })
    }
}

/// Signs a token the way the account service does. Valid for `ttl`.
///
/// Tokens are normally minted by the account service; this exists for tests
/// and local tooling.
#[doc(hidden)]
pub fn issue_token(
    secret: &[u8],
    user_id: UserId,
    email: &str,
    ttl: chrono::Duration,
) -> Result<String, AuthError> {
    let now = chrono::Utc::now();
    let claims = Claims {
        user_id,
        email: email.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    Ok(jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )?)
}

/// Reads the token from `Authorization: Bearer <token>`, or from `?token=`
/// when the header is absent (browsers can't set headers on a websocket upgrade).
pub fn bearer_token(parts: &Parts) -> Result<String, AuthError> {
    if let Some(header) = parts.headers.get(AUTHORIZATION) {
        let value = header.to_str().map_err(|_| AuthError::MalformedHeader)?;
        let mut fields = value.split_whitespace();
        return match (fields.next(), fields.next(), fields.next()) {
            (Some("Bearer"), Some(token), None) => Ok(token.to_string()),
            _ => Err(AuthError::MalformedHeader),
        };
    }

    Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(mut params)| params.remove("token"))
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)
}

/// Extractor for the authenticated caller.
pub struct AuthUser(pub Identity);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        state.identity.identify(&token).await.map(AuthUser)
    }
}
