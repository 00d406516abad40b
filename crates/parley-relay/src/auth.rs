use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use parley_protocol::Identity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::AuthConfig;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("credential expired")]
    Expired,

    #[error("{0}")]
    Invalid(String),
}

/// Turns the credential presented on `admit` into a stable identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// JWT claims; `sub` carries the identity.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    pub iat: u64,
}

/// HS256 JWT verifier sharing a secret with the token issuer.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("token has an empty subject".to_string()));
        }
        Ok(data.claims.sub)
    }
}

/// Fixed token table, for development setups without an identity provider.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, Identity>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unknown token".to_string()))
    }
}

/// Mint an HS256 token for `identity`.
pub fn issue_token(
    secret: &str,
    identity: &str,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let claims = Claims {
        sub: identity.to_string(),
        exp: now + ttl.as_secs(),
        iat: now,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Build the verifier selected by configuration. A JWT secret wins over the
/// static table.
pub fn verifier_from_config(config: &AuthConfig) -> anyhow::Result<Arc<dyn TokenVerifier>> {
    if let Some(secret) = config.jwt_secret.as_deref().filter(|s| !s.is_empty()) {
        return Ok(Arc::new(JwtVerifier::new(secret)));
    }
    if !config.static_tokens.is_empty() {
        tracing::warn!(
            count = config.static_tokens.len(),
            "using static token table; do not use in production"
        );
        return Ok(Arc::new(StaticTokenVerifier::new(
            config.static_tokens.clone(),
        )));
    }
    anyhow::bail!("no authentication configured: set auth.jwt_secret or auth.static_tokens")
}
