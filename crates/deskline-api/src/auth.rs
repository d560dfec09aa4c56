//! Bearer-token verification and the per-request caller.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use deskline_core::models::Memberships;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::{AppConfig, SupabaseAuthConfig};
use crate::error::AppError;

/// Subject of a verified access token
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub session_id: Option<String>,
}

/// Verified identity plus its organization roles, resolved once per request
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub session_id: Option<String>,
    pub memberships: Memberships,
}

impl Caller {
    pub fn new(identity: Identity, memberships: Memberships) -> Self {
        Self {
            user_id: identity.user_id,
            session_id: identity.session_id,
            memberships,
        }
    }
}

/// Accepts HS256 tokens signed with `AUTH_JWT_SECRET` and RS256 tokens
/// signed by a key in the Supabase JWKS.
pub struct JwtVerifier {
    shared_secret: Option<DecodingKey>,
    jwks: Option<JwksKeys>,
    leeway: Duration,
}

impl JwtVerifier {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            shared_secret: config
                .jwt_secret
                .as_deref()
                .map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            jwks: config.supabase.clone().map(JwksKeys::new),
            leeway: config.auth_clock_skew,
        }
    }

    pub async fn verify_access_token(&self, token: &str) -> Result<Identity, AppError> {
        let header = decode_header(token)
            .map_err(|error| rejected("Token header decode failed", &error))?;

        let claims = match header.alg {
            Algorithm::HS256 => {
                let key = self
                    .shared_secret
                    .as_ref()
                    .ok_or_else(|| AppError::unauthorized("HS256 tokens are not accepted"))?;
                self.decode_claims(token, key, Algorithm::HS256, None)?
            }
            Algorithm::RS256 => {
                let jwks = self
                    .jwks
                    .as_ref()
                    .ok_or_else(|| AppError::unauthorized("RS256 tokens are not accepted"))?;
                let kid = header
                    .kid
                    .ok_or_else(|| AppError::unauthorized("Token header missing `kid`"))?;
                let key = jwks.key(&kid).await?;
                let claims = self.decode_claims(
                    token,
                    &key,
                    Algorithm::RS256,
                    Some(jwks.config.issuer.as_str()),
                )?;
                claims.require_supabase_user(&jwks.config.audience)?;
                claims
            }
            other => {
                return Err(AppError::unauthorized(format!(
                    "Token algorithm {other:?} is not accepted"
                )))
            }
        };

        claims.require_lifetime(self.leeway)?;
        claims.into_identity()
    }

    fn decode_claims(
        &self,
        token: &str,
        key: &DecodingKey,
        algorithm: Algorithm,
        issuer: Option<&str>,
    ) -> Result<AccessClaims, AppError> {
        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;
        validation.leeway = self.leeway.as_secs();
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }

        decode::<AccessClaims>(token, key, &validation)
            .map(|decoded| decoded.claims)
            .map_err(|error| rejected("Token validation failed", &error))
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = token.trim();
            if token.is_empty() {
                Err(AppError::unauthorized("Bearer token is empty"))
            } else {
                Ok(token)
            }
        }
        Some(_) => Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        )),
        None => Err(AppError::unauthorized(
            "Authorization header must be `Bearer <token>`",
        )),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AccessClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AccessClaims {
    /// `exp` and `iat` are mandatory; `nbf` is honoured when present.
    fn require_lifetime(&self, skew: Duration) -> Result<(), AppError> {
        let now = chrono::Utc::now().timestamp();
        let skew = i64::try_from(skew.as_secs()).unwrap_or(0);
        let earliest = now.saturating_sub(skew);
        let latest = now.saturating_add(skew);

        match (self.exp, self.iat) {
            (None, _) => Err(AppError::unauthorized("Token missing `exp` claim")),
            (_, None) => Err(AppError::unauthorized("Token missing `iat` claim")),
            (Some(exp), _) if exp <= earliest => Err(AppError::unauthorized("Token is expired")),
            (_, Some(iat)) if iat > latest => {
                Err(AppError::unauthorized("Token `iat` is in the future"))
            }
            _ if self.nbf.is_some_and(|nbf| nbf > latest) => {
                Err(AppError::unauthorized("Token is not yet valid"))
            }
            _ => Ok(()),
        }
    }

    fn require_supabase_user(&self, audience: &str) -> Result<(), AppError> {
        if !audience_matches(self.aud.as_ref(), audience) {
            return Err(AppError::unauthorized("Token audience is not allowed"));
        }
        if self.role.as_deref() != Some("authenticated") {
            return Err(AppError::unauthorized("Token role is not allowed"));
        }
        Ok(())
    }

    fn into_identity(self) -> Result<Identity, AppError> {
        let user_id = self.sub.trim().to_string();
        if user_id.is_empty() {
            return Err(AppError::unauthorized("Token subject is missing"));
        }
        Ok(Identity {
            user_id,
            session_id: self.session_id.or(self.jti),
        })
    }
}

/// RS256 signing keys fetched from the JWKS endpoint, refreshed when stale
/// or when a token names an unknown `kid`.
struct JwksKeys {
    client: reqwest::Client,
    config: SupabaseAuthConfig,
    cache: RwLock<CachedKeys>,
}

#[derive(Default)]
struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

impl CachedKeys {
    fn fresh(&self, kid: &str, ttl: Duration) -> Option<DecodingKey> {
        let fetched_at = self.fetched_at?;
        if fetched_at.elapsed() > ttl {
            return None;
        }
        self.keys.get(kid).cloned()
    }
}

impl JwksKeys {
    fn new(config: SupabaseAuthConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            cache: RwLock::new(CachedKeys::default()),
        }
    }

    async fn key(&self, kid: &str) -> Result<DecodingKey, AppError> {
        let ttl = self.config.jwks_cache_ttl;
        if let Some(key) = self.cache.read().await.fresh(kid, ttl) {
            return Ok(key);
        }

        let mut cache = self.cache.write().await;
        // Another request may have refreshed while we waited for the lock
        if let Some(key) = cache.fresh(kid, ttl) {
            return Ok(key);
        }

        cache.keys = self.fetch().await?;
        cache.fetched_at = Some(Instant::now());
        tracing::info!(keys = cache.keys.len(), "Refreshed JWKS signing keys");

        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| AppError::unauthorized("Signing key not found in Supabase JWKS"))
    }

    async fn fetch(&self) -> Result<HashMap<String, DecodingKey>, AppError> {
        let response = self
            .client
            .get(&self.config.jwks_url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| AppError::external(format!("JWKS request failed: {}", sanitize(&error))))?;

        if !response.status().is_success() {
            return Err(AppError::external(format!(
                "JWKS request failed with HTTP {}",
                response.status().as_u16()
            )));
        }

        let document = response.json::<JwksDocument>().await.map_err(|error| {
            AppError::external(format!("JWKS JSON parse failed: {}", sanitize(&error)))
        })?;
        signing_keys(document)
    }
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: Option<String>,
    #[serde(rename = "use")]
    usage: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

/// RSA signature keys of a JWKS document, by `kid`
fn signing_keys(document: JwksDocument) -> Result<HashMap<String, DecodingKey>, AppError> {
    let mut keys = HashMap::new();
    for jwk in document.keys {
        let is_rsa_signing_key =
            jwk.kty.as_deref() == Some("RSA") && jwk.usage.as_deref().is_none_or(|usage| usage == "sig");
        let (true, Some(kid), Some(n), Some(e)) = (is_rsa_signing_key, jwk.kid, jwk.n, jwk.e) else {
            continue;
        };
        let key = DecodingKey::from_rsa_components(&n, &e).map_err(|error| {
            AppError::external(format!("Invalid JWKS RSA key: {}", sanitize(&error)))
        })?;
        keys.insert(kid, key);
    }

    if keys.is_empty() {
        return Err(AppError::external(
            "JWKS did not include any usable RSA signing keys",
        ));
    }
    Ok(keys)
}

fn audience_matches(aud: Option<&Value>, expected: &str) -> bool {
    match aud {
        Some(Value::String(value)) => value == expected,
        Some(Value::Array(values)) => values.iter().any(|value| value.as_str() == Some(expected)),
        _ => false,
    }
}

fn rejected(context: &str, error: &impl std::fmt::Display) -> AppError {
    AppError::unauthorized(format!("{context}: {}", sanitize(error)))
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

/// Mint a short-lived HS256 access token for `user_id`
#[cfg(test)]
pub(crate) fn issue_hs256_token(secret: &str, user_id: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = AccessClaims {
        sub: user_id.to_string(),
        aud: None,
        role: Some("authenticated".to_string()),
        exp: Some(now + 600),
        iat: Some(now),
        nbf: None,
        jti: None,
        session_id: Some("test-session".to_string()),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
