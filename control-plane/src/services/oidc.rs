//! OpenID Connect client for external identity providers.
//!
//! Discovery documents are fetched once per provider and cached until the
//! provider is updated or deleted. Every outbound call runs under the
//! configured HTTP timeout; a timeout surfaces as `502 Bad Gateway`, any other
//! upstream failure as `401 Unauthorized`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;

use crate::models::Provider;
use crate::uid::Id;

/// Provider tokens expiring sooner than this are refreshed before use.
pub const REFRESH_WINDOW: ChronoDuration = ChronoDuration::minutes(5);

/// Applied when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: i64 = 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    email: String,
}

/// The userinfo claims we keep.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Tokens obtained by exchanging an authorization code.
#[derive(Debug, Clone)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// From the validated id token.
    pub email: String,
}

pub struct OidcClient {
    http: reqwest::Client,
    discovery: DashMap<Id, Arc<Discovery>>,
}

fn upstream(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        tracing::warn!(error = %err, "Identity provider timed out");
        AppError::BadGateway("identity provider did not respond in time".to_string())
    } else {
        AppError::unauthorized(format!("identity provider request failed: {}", err))
    }
}

/// The provider's issuer base URL. Bare hosts are served over https.
pub fn issuer_url(provider: &Provider) -> String {
    let url = provider.url.trim().trim_end_matches('/');
    if url.starts_with("https://") || url.starts_with("http://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

impl OidcClient {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("failed to build OIDC http client: {}", e)))?;
        Ok(Self {
            http,
            discovery: DashMap::new(),
        })
    }

    /// Drops the cached discovery document for `provider_id`.
    pub fn invalidate(&self, provider_id: Id) {
        if self.discovery.remove(&provider_id).is_some() {
            tracing::debug!(provider_id = %provider_id, "Invalidated OIDC configuration");
        }
    }

    pub async fn discover(&self, provider: &Provider) -> Result<Arc<Discovery>, AppError> {
        if let Some(cached) = self.discovery.get(&provider.id) {
            return Ok(Arc::clone(cached.value()));
        }

        let url = format!("{}/.well-known/openid-configuration", issuer_url(provider));
        let response = self.http.get(&url).send().await.map_err(upstream)?;
        if !response.status().is_success() {
            return Err(AppError::unauthorized(format!(
                "provider discovery returned {}",
                response.status()
            )));
        }
        let document: Discovery = response.json().await.map_err(upstream)?;
        let document = Arc::new(document);
        self.discovery.insert(provider.id, Arc::clone(&document));
        Ok(document)
    }

    async fn token_request(&self, endpoint: &str, form: &[(&str, &str)]) -> Result<TokenResponse, AppError> {
        let response = self.http.post(endpoint).form(form).send().await.map_err(upstream)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = %status, body = %body, "Token endpoint rejected the request");
            return Err(AppError::unauthorized(format!("token endpoint returned {}", status)));
        }
        response.json().await.map_err(upstream)
    }

    /// Exchanges an authorization code and validates the returned id token.
    pub async fn exchange(
        &self,
        provider: &Provider,
        client_secret: &str,
        code: &str,
        redirect_url: &str,
    ) -> Result<ProviderTokens, AppError> {
        let discovery = self.discover(provider).await?;
        let tokens = self
            .token_request(
                &discovery.token_endpoint,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_url),
                    ("client_id", &provider.client_id),
                    ("client_secret", client_secret),
                ],
            )
            .await?;

        let id_token = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| AppError::unauthorized("token response has no id_token"))?;
        let claims = self
            .validate_id_token(&discovery, provider, id_token)
            .await?;

        if tokens.refresh_token.is_none() {
            tracing::warn!(provider_id = %provider.id, "Provider returned no refresh token");
        }

        Ok(ProviderTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.unwrap_or_default(),
            expires_at: Utc::now()
                + ChronoDuration::seconds(tokens.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME)),
            email: claims.email,
        })
    }

    /// Checks the id token's signature, issuer, audience and expiry. Only
    /// asymmetric keys published at the provider's `jwks_uri` are trusted, and
    /// the token's algorithm must belong to the family of the key it names.
    async fn validate_id_token(
        &self,
        discovery: &Discovery,
        provider: &Provider,
        raw: &str,
    ) -> Result<IdTokenClaims, AppError> {
        let header = decode_header(raw).map_err(|e| AppError::unauthorized(format!("id token: {}", e)))?;
        let jwk = self.signing_key(discovery, header.kid.as_deref()).await?;
        if !key_accepts(&jwk, header.alg) {
            return Err(AppError::unauthorized(format!(
                "id token algorithm {:?} does not match the provider's signing key",
                header.alg
            )));
        }
        let key = DecodingKey::from_jwk(&jwk).map_err(|e| AppError::unauthorized(format!("signing key: {}", e)))?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&discovery.issuer]);
        validation.set_audience(&[&provider.client_id]);

        let data = decode::<IdTokenClaims>(raw, &key, &validation)
            .map_err(|e| AppError::unauthorized(format!("validate id token: {}", e)))?;
        Ok(data.claims)
    }

    async fn signing_key(&self, discovery: &Discovery, kid: Option<&str>) -> Result<Jwk, AppError> {
        let jwks_uri = discovery
            .jwks_uri
            .as_deref()
            .ok_or_else(|| AppError::unauthorized("provider publishes no jwks_uri"))?;
        let response = self.http.get(jwks_uri).send().await.map_err(upstream)?;
        if !response.status().is_success() {
            return Err(AppError::unauthorized(format!("jwks returned {}", response.status())));
        }
        let keys: JwkSet = response.json().await.map_err(upstream)?;

        match kid {
            Some(kid) => keys.find(kid).cloned(),
            None => keys.keys.into_iter().next(),
        }
        .ok_or_else(|| AppError::unauthorized("no matching signing key"))
    }

    /// Trades a refresh token for a new access token and its expiry.
    pub async fn refresh(
        &self,
        provider: &Provider,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<(String, DateTime<Utc>), AppError> {
        if refresh_token.is_empty() {
            return Err(AppError::unauthorized("no refresh token stored"));
        }
        let discovery = self.discover(provider).await?;
        let tokens = self
            .token_request(
                &discovery.token_endpoint,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", &provider.client_id),
                    ("client_secret", client_secret),
                ],
            )
            .await?;
        let expires_at =
            Utc::now() + ChronoDuration::seconds(tokens.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME));
        Ok((tokens.access_token, expires_at))
    }

    pub async fn user_info(&self, provider: &Provider, access_token: &str) -> Result<UserInfo, AppError> {
        let discovery = self.discover(provider).await?;
        let endpoint = discovery
            .userinfo_endpoint
            .clone()
            .unwrap_or_else(|| format!("{}/oauth2/v1/userinfo", issuer_url(provider)));

        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(upstream)?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AppError::unauthorized("provider revoked the session"));
        }
        if !response.status().is_success() {
            return Err(AppError::unauthorized(format!("userinfo returned {}", response.status())));
        }

        let info: UserInfo = response.json().await.map_err(upstream)?;
        if info.groups.is_empty() {
            tracing::debug!(provider_id = %provider.id, "Userinfo has no groups");
        }
        Ok(info)
    }
}

/// Symmetric algorithms never verify, so a leaked client secret cannot mint
/// id tokens.
fn key_accepts(key: &Jwk, alg: Algorithm) -> bool {
    match &key.algorithm {
        AlgorithmParameters::RSA(_) => matches!(
            alg,
            Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512
        ),
        AlgorithmParameters::EllipticCurve(params) => matches!(
            (&params.curve, alg),
            (EllipticCurve::P256, Algorithm::ES256) | (EllipticCurve::P384, Algorithm::ES384)
        ),
        AlgorithmParameters::OctetKeyPair(_) => alg == Algorithm::EdDSA,
        AlgorithmParameters::OctetKey(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;

    #[test]
    fn bare_hosts_default_to_https() {
        let mut provider = Provider::new("okta", ProviderKind::Okta);
        provider.url = "example.okta.com/".to_string();
        assert_eq!(issuer_url(&provider), "https://example.okta.com");

        provider.url = "http://127.0.0.1:8080".to_string();
        assert_eq!(issuer_url(&provider), "http://127.0.0.1:8080");
    }

    #[test]
    fn symmetric_algorithms_are_refused_for_published_keys() {
        let rsa: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "RSA", "kid": "k1", "n": "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1WlUzewbgBHod5pcM9H95GQRV3JDXboIRROSBigeC5yjU1hGzHHyXss8UDprecbAYxknTcQkhslANGRUZmdTOQ5qTRsLAt6BTYuyvVRdhS8exSZEy_c4gs_7svlJJQ4H9_NxsiIoLwAEk7-Q3UXERGYw_75IDrGA84-lA_-Ct4eTlXHBIY2EaV7t7LjJaynVJCpkv4LKjTTAumiGUIuQhrNhZLuF_RJLqHpM2kgWFLU7-VTdL1VbC2tejvcI2BlMkEpk1BzBZI0KQB0GaDWFLN-aEAw3vRw",
            "e": "AQAB"
        }))
        .unwrap();
        assert!(key_accepts(&rsa, Algorithm::RS256));
        assert!(!key_accepts(&rsa, Algorithm::HS256));
        assert!(!key_accepts(&rsa, Algorithm::ES256));

        let secret: Jwk = serde_json::from_value(serde_json::json!({"kty": "oct", "k": "c2VjcmV0"})).unwrap();
        assert!(!key_accepts(&secret, Algorithm::HS256));
    }
}
