//! Login, logout, signup and password reset.

use axum::http::{header, StatusCode};
use chrono::Utc;
use service_core::error::AppError;

use crate::api::{cookies, EmptyRequest, RequestContext, Route, Routes};
use crate::dtos::auth::{
    LoginRequest, LoginResponse, PasswordResetRequest, SignupRequest, SignupResponse,
    VerificationLink, VerifiedPasswordResetRequest,
};
use crate::dtos::ErrorResponse;
use crate::services::login::{self, LoginError, LoginMethod, LoginResult};
use crate::services::password_reset;
use crate::services::signup::{self, SignupInput};

pub fn register(routes: &mut Routes) {
    routes
        .add(Route::post("/api/login", login).public())
        .add(Route::post("/api/logout", logout))
        .add(Route::post("/api/password-reset-request", request_password_reset).public())
        .add(Route::post("/api/password-reset", reset_password).public())
        .add(Route::get("/link", verify_email).public().unversioned());
}

/// Signup is served from the base domain, which belongs to no organization.
pub fn signup_routes() -> Routes {
    let mut routes = Routes::new();
    routes.add(
        Route::post("/api/signup", signup)
            .public()
            .without_organization(),
    );
    routes
}

/// Sets the session cookies for a fresh login on the organization's domain.
fn set_session_cookies(ctx: &RequestContext, result: &LoginResult, domain: &str) {
    let expires_at = result.issued.key.expires_at;
    ctx.add_cookie(cookies::auth(&result.issued.bearer, domain, expires_at));
    ctx.add_cookie(cookies::login(domain, expires_at));
}

/// Log in with a password, an access key or an OIDC authorization code.
#[utoipa::path(
    post,
    path = "/api/login",
    request_body = LoginRequest,
    responses(
        (status = 201, description = "Logged in; the session key is also set as the auth cookie", body = LoginResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 401, description = "Login failed", body = ErrorResponse),
        (status = 429, description = "Too many failed attempts", body = ErrorResponse),
        (status = 502, description = "Identity provider unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(ctx: RequestContext, req: LoginRequest) -> Result<LoginResponse, AppError> {
    let state = ctx.state();
    let org = ctx.organization()?.clone();

    let method = if let Some(creds) = req.password_credentials {
        LoginMethod::Password {
            name: creds.name,
            password: creds.password,
        }
    } else if let Some(bearer) = req.access_key {
        LoginMethod::AccessKey { bearer }
    } else if let Some(oidc) = req.oidc {
        LoginMethod::Oidc {
            provider_id: oidc.provider_id,
            code: oidc.code,
            redirect_url: oidc.redirect_url,
        }
    } else {
        return Err(AppError::bad_request("missing login credentials"));
    };

    let mut tx = ctx.tx().await?;
    let outcome = state.authenticator().login(tx.as_mut(), method).await;
    drop(tx);
    let result = match outcome {
        Ok(result) => result,
        Err(LoginError::Revoked) => {
            ctx.commit().await?;
            return Err(LoginError::Revoked.into());
        }
        Err(err) => return Err(err.into()),
    };
    set_session_cookies(&ctx, &result, &org.domain);
    Ok(LoginResponse::from(&result))
}

/// Revoke the access key used for this request.
#[utoipa::path(
    post,
    path = "/api/logout",
    responses(
        (status = 200, description = "Logged out; session cookies cleared"),
        (status = 401, description = "Not authenticated", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Authentication"
)]
pub async fn logout(ctx: RequestContext, _req: EmptyRequest) -> Result<(), AppError> {
    let key = ctx
        .access_key()
        .ok_or_else(|| AppError::unauthorized("no access key"))?
        .clone();
    let domain = ctx.organization()?.domain.clone();
    let mut tx = ctx.tx().await?;
    login::logout(tx.as_mut(), &key).await?;
    drop(tx);
    ctx.add_cookie(cookies::clear(cookies::AUTH, &domain));
    ctx.add_cookie(cookies::clear(cookies::LOGIN, &domain));
    ctx.set_status(StatusCode::OK);
    Ok(())
}

/// Create an organization and its first admin.
#[utoipa::path(
    post,
    path = "/api/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "Organization created; a signup cookie carries the session to its domain", body = SignupResponse),
        (status = 400, description = "Validation error or signup disabled", body = ErrorResponse),
        (status = 409, description = "Subdomain already taken", body = ErrorResponse),
        (status = 429, description = "Too many signups from this address", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn signup(ctx: RequestContext, req: SignupRequest) -> Result<SignupResponse, AppError> {
    let state = ctx.state();
    let input = SignupInput {
        org_name: req.org.name,
        subdomain: req.org.sub_domain,
        user_name: req.user.username,
        password: req.user.password,
    };

    let mut tx = ctx.tx().await?;
    let signed_up = signup::signup(
        tx.as_mut(),
        input,
        &state.config.signup,
        &state.config.password_policy,
        &state.authenticator(),
        state.email.as_ref(),
    )
    .await?;
    drop(tx);

    ctx.add_cookie(cookies::signup(
        &signed_up.login.issued.bearer,
        &state.config.signup.base_domain,
    ));
    Ok(SignupResponse {
        id: signed_up.organization.id,
        name: signed_up.organization.name,
        domain: signed_up.organization.domain,
    })
}

/// Email a password reset link. Answers the same whether or not the
/// address belongs to a user.
#[utoipa::path(
    post,
    path = "/api/password-reset-request",
    request_body = PasswordResetRequest,
    responses(
        (status = 201, description = "Request accepted"),
        (status = 400, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn request_password_reset(ctx: RequestContext, req: PasswordResetRequest) -> Result<(), AppError> {
    let state = ctx.state();
    let org = ctx.organization()?.clone();
    let mut tx = ctx.tx().await?;
    password_reset::request(tx.as_mut(), &req.email, &org, state.email.as_ref()).await?;
    Ok(())
}

/// Set a new password with an emailed token and start a session.
#[utoipa::path(
    post,
    path = "/api/password-reset",
    request_body = VerifiedPasswordResetRequest,
    responses(
        (status = 201, description = "Password set and logged in", body = LoginResponse),
        (status = 400, description = "Validation error or weak password", body = ErrorResponse),
        (status = 401, description = "Invalid or expired token", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn reset_password(ctx: RequestContext, req: VerifiedPasswordResetRequest) -> Result<LoginResponse, AppError> {
    let state = ctx.state();
    let org = ctx.organization()?.clone();
    let now = Utc::now();

    let mut tx = ctx.tx().await?;
    let identity = password_reset::reset(
        tx.as_mut(),
        &req.token,
        &req.password,
        &state.config.password_policy,
        state.config.bcrypt_cost,
        now,
    )
    .await?;
    let infra = tx.get_infra_provider().await?;
    let authenticator = state.authenticator();
    let expires_at = authenticator.session_expiry(now);
    let result = authenticator
        .start_session(tx.as_mut(), identity, infra.id, expires_at, false)
        .await?;
    drop(tx);
    set_session_cookies(&ctx, &result, &org.domain);
    Ok(LoginResponse::from(&result))
}

/// Only same-site paths are followed after verification.
fn redirect_target(r: &str) -> &str {
    if r.starts_with('/') && !r.starts_with("//") && !r.contains('\\') {
        r
    } else {
        "/"
    }
}

/// Confirm an email address from the link in a verification email.
#[utoipa::path(
    get,
    path = "/link",
    params(
        ("vt" = String, Query, description = "Verification token"),
        ("r" = Option<String>, Query, description = "Path to redirect to")
    ),
    responses(
        (status = 302, description = "Verified; redirects to the requested path"),
        (status = 401, description = "Invalid or expired token", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn verify_email(ctx: RequestContext, req: VerificationLink) -> Result<(), AppError> {
    let mut tx = ctx.tx().await?;
    let identity = password_reset::verify_email(tx.as_mut(), &req.vt, Utc::now()).await?;
    drop(tx);
    tracing::info!(user_id = %identity.id, "Verified email address");
    ctx.set_status(StatusCode::FOUND);
    ctx.set_header(header::LOCATION, redirect_target(&req.r));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirects_stay_on_site() {
        assert_eq!(redirect_target("/settings"), "/settings");
        assert_eq!(redirect_target(""), "/");
        assert_eq!(redirect_target("//evil.example.com"), "/");
        assert_eq!(redirect_target("https://evil.example.com"), "/");
    }
}
