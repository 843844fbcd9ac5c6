use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use moka::future::Cache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::routes::{ApiError, AppState};

pub const DEVELOPMENT_USER: &str = "development_user";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Not authenticated")]
    MissingCredential,
    #[error("Invalid or expired token: {0}")]
    InvalidToken(String),
    #[error("Signing keys unavailable: {0}")]
    KeysUnavailable(String),
}

/// Turns a bearer credential into a stable user id.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, AuthError>;

    /// Identity granted to requests that present no credential at all.
    fn anonymous_identity(&self) -> Option<String> {
        None
    }
}

/// Accepts everything as [`DEVELOPMENT_USER`]. Only built when `BYPASS_AUTH`
/// is set outside production.
pub struct DevelopmentVerifier;

#[async_trait]
impl IdentityVerifier for DevelopmentVerifier {
    async fn verify(&self, _token: &str) -> Result<String, AuthError> {
        Ok(DEVELOPMENT_USER.to_string())
    }

    fn anonymous_identity(&self) -> Option<String> {
        Some(DEVELOPMENT_USER.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirebaseClaims {
    pub sub: String,
    pub aud: String,
    pub iss: String,
    pub exp: u64,
    pub iat: u64,
}

/// Verifies Firebase ID tokens (RS256) against Google's published JWK set.
pub struct FirebaseVerifier {
    client: Client,
    jwks_url: String,
    project_id: String,
    keys: Cache<(), Arc<JwkSet>>,
}

impl FirebaseVerifier {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent("HorizonWeather/1.0")
            .timeout(Duration::from_secs(10))
            .build()?;

        let keys = Cache::builder()
            .max_capacity(1)
            .time_to_live(Duration::from_secs(config.firebase_jwks_ttl_secs))
            .build();

        Ok(Self {
            client,
            jwks_url: config.firebase_jwks_url.clone(),
            project_id: config.firebase_project_id.clone(),
            keys,
        })
    }

    fn issuer(&self) -> String {
        format!("https://securetoken.google.com/{}", self.project_id)
    }

    async fn signing_keys(&self) -> Result<Arc<JwkSet>, AuthError> {
        self.keys
            .try_get_with((), self.fetch_keys())
            .await
            .map_err(|e| AuthError::KeysUnavailable(e.to_string()))
    }

    async fn fetch_keys(&self) -> Result<Arc<JwkSet>, AuthError> {
        tracing::debug!("Fetching signing keys from {}", self.jwks_url);

        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::KeysUnavailable(e.to_string()))?;

        let keys: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::KeysUnavailable(e.to_string()))?;

        Ok(Arc::new(keys))
    }
}

#[async_trait]
impl IdentityVerifier for FirebaseVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidToken(format!("unexpected algorithm {:?}", header.alg)));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("missing key id".to_string()))?;

        let mut keys = self.signing_keys().await?;
        if keys.find(&kid).is_none() {
            // Google rotates keys; refresh once before rejecting.
            self.keys.invalidate(&()).await;
            keys = self.signing_keys().await?;
        }
        let jwk = keys
            .find(&kid)
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown key id {}", kid)))?;
        let key = DecodingKey::from_jwk(jwk).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.project_id]);
        validation.set_issuer(&[self.issuer()]);
        validation.set_required_spec_claims(&["exp", "iat", "aud", "iss", "sub"]);

        let data = decode::<FirebaseClaims>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".to_string()));
        }

        Ok(data.claims.sub)
    }
}

/// Picks the verifier for this process. The bypass is never implicit.
pub fn build_verifier(config: &Config) -> anyhow::Result<Arc<dyn IdentityVerifier>> {
    if config.bypass_auth {
        tracing::warn!(
            "AUTHENTICATION BYPASS ENABLED (APP_ENV={}): every request runs as {}",
            config.app_env,
            DEVELOPMENT_USER
        );
        return Ok(Arc::new(DevelopmentVerifier));
    }

    Ok(Arc::new(FirebaseVerifier::new(config)?))
}

/// The caller's user id, resolved from the `Authorization: Bearer` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(&parts.headers) else {
            return state
                .verifier
                .anonymous_identity()
                .map(AuthenticatedUser)
                .ok_or(ApiError::Unauthorized(AuthError::MissingCredential));
        };

        match state.verifier.verify(token).await {
            Ok(user_id) => Ok(AuthenticatedUser(user_id)),
            Err(e) => {
                tracing::warn!("Rejected bearer credential: {}", e);
                Err(ApiError::Unauthorized(e))
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
