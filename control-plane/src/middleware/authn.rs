//! Request authentication: bearer or cookie to access key, key to user and
//! organization, then the per-organization rate limit.

use axum::http::{header, HeaderMap, Method};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::{Duration, Utc};
use service_core::error::AppError;

use crate::api::context::Authenticated;
use crate::api::cookies;
use crate::data::{optional, DataError, Transaction};
use crate::middleware::tenant;
use crate::models::access_key::SCOPE_PASSWORD_RESET;
use crate::services::{access_keys, destinations};
use crate::AppState;

pub const DESTINATION_HEADER: &str = "infra-destination";

/// Writes to `last_seen_at` closer together than this are skipped.
const LAST_SEEN_DAMPING: Duration = Duration::seconds(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// A valid access key is required.
    Required,
    /// No credentials are read; only the organization is resolved.
    Public,
}

enum BearerSource {
    Header,
    AuthCookie,
    SignupCookie,
}

fn bearer(headers: &HeaderMap, jar: &CookieJar) -> Option<(String, BearerSource)> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    if let Some(token) = from_header {
        return Some((token, BearerSource::Header));
    }
    if let Some(token) = cookies::value(jar, cookies::AUTH) {
        return Some((token, BearerSource::AuthCookie));
    }
    cookies::value(jar, cookies::SIGNUP).map(|token| (token, BearerSource::SignupCookie))
}

pub struct RequestInfo<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub jar: &'a CookieJar,
}

impl RequestInfo<'_> {
    fn host(&self) -> Option<&str> {
        self.headers.get(header::HOST).and_then(|v| v.to_str().ok())
    }
}

/// Resolves the caller. Returns the cookies the response must set, which
/// is only the case when a signup session is moved onto the new
/// organization's domain.
pub async fn authenticate(
    state: &AppState,
    tx: &mut dyn Transaction,
    request: &RequestInfo<'_>,
    mode: AuthMode,
) -> Result<(Authenticated, Vec<Cookie<'static>>), AppError> {
    let host_org = tenant::from_host(tx, request.host(), state.default_org.as_ref()).await?;

    if mode == AuthMode::Public {
        if let Some(org) = &host_org {
            tx.set_organization_id(Some(org.id));
            state.limiter.check_organization(org.id).await?;
        }
        return Ok((
            Authenticated {
                organization: host_org,
                ..Default::default()
            },
            Vec::new(),
        ));
    }

    let (token, source) = bearer(request.headers, request.jar)
        .ok_or_else(|| AppError::unauthorized("valid token not found in request"))?;
    let now = Utc::now();
    let key = access_keys::validate(tx, &token, now).await?;

    let key_org = tx.get_organization(key.organization_id).await?;
    let org = tenant::reconcile(host_org, key_org)?;
    tx.set_organization_id(Some(org.id));
    state.limiter.check_organization(org.id).await?;

    if key.has_scope(SCOPE_PASSWORD_RESET) {
        let allowed = format!("/api/users/{}", key.issued_for);
        if request.method != Method::PUT || request.path != allowed {
            return Err(AppError::unauthorized(
                "temporary passwords can only be used to set new passwords",
            ));
        }
    }

    let mut user = match tx.get_identity(key.issued_for).await {
        Ok(user) => user,
        Err(DataError::NotFound) => {
            // Keys issued for a provider authenticate its SCIM client, not a user.
            if optional(tx.get_provider(key.issued_for).await)?.is_some() {
                tracing::debug!(provider_id = %key.issued_for, org_id = %org.id, "Authenticated provider key");
                return Ok((
                    Authenticated {
                        organization: Some(org),
                        user: None,
                        access_key: Some(key),
                    },
                    Vec::new(),
                ));
            }
            return Err(AppError::unauthorized("identity for key not found"));
        }
        Err(e) => return Err(e.into()),
    };
    if user.last_seen_at.map_or(true, |seen| now - seen > LAST_SEEN_DAMPING) {
        tx.update_identity_last_seen(user.id, now).await?;
        user.last_seen_at = Some(now);
    }

    if let Some(unique_id) = request
        .headers
        .get(DESTINATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        destinations::touch(tx, unique_id, now).await?;
    }

    let mut set_cookies = Vec::new();
    if let BearerSource::SignupCookie = source {
        set_cookies.push(cookies::auth(&token, &org.domain, key.expires_at));
        set_cookies.push(cookies::login(&org.domain, key.expires_at));
        set_cookies.push(cookies::clear(cookies::SIGNUP, &state.config.signup.base_domain));
    }

    tracing::debug!(user_id = %user.id, org_id = %org.id, "Authenticated request");
    Ok((
        Authenticated {
            organization: Some(org),
            user: Some(user),
            access_key: Some(key),
        },
        set_cookies,
    ))
}
