//! Emailed single-use tokens: password resets, invites and address
//! verification.

use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;

use crate::data::{optional, DataError, Transaction};
use crate::models::{EmailVerificationToken, Identity, Organization, PasswordResetToken};
use crate::services::email::EmailProvider;
use crate::services::users;
use crate::utils::PasswordPolicy;

pub fn reset_ttl() -> Duration {
    Duration::minutes(15)
}

pub fn verification_ttl() -> Duration {
    Duration::hours(72)
}

/// `https://<org domain>/link?vt=<token>&r=<path>`; opening it verifies the
/// address and redirects to `redirect`.
pub fn verification_link(domain: &str, token: &str, redirect: &str) -> String {
    let query = serde_urlencoded::to_string([("vt", token), ("r", redirect)]).unwrap_or_default();
    format!("https://{}/link?{}", domain, query)
}

/// Mails a reset link when `email_address` names a user. Unknown addresses
/// succeed silently so the endpoint does not reveal who has an account.
pub async fn request(
    tx: &mut dyn Transaction,
    email_address: &str,
    org: &Organization,
    email: &dyn EmailProvider,
) -> Result<(), AppError> {
    let identity = match optional(tx.get_identity_by_name(email_address).await)? {
        Some(identity) if !identity.is_connector() => identity,
        _ => {
            tracing::debug!("Password reset requested for an unknown user");
            return Ok(());
        }
    };

    let mut token = PasswordResetToken::new(identity.id, reset_ttl());
    tx.create_password_reset_token(&mut token).await?;
    let link = format!("https://{}/password-reset?token={}", org.domain, token.token);
    email.send_password_reset(&identity.name, &link).await?;
    tracing::info!(user_id = %identity.id, "Sent password reset");
    Ok(())
}

/// Claims `token` and sets a permanent password for its owner, who also
/// counts as verified from now on.
pub async fn reset(
    tx: &mut dyn Transaction,
    token: &str,
    password: &str,
    policy: &PasswordPolicy,
    cost: u32,
    now: DateTime<Utc>,
) -> Result<Identity, AppError> {
    policy.check("password", password)?;
    let claimed = match tx.claim_password_reset_token(token, now).await {
        Ok(claimed) => claimed,
        Err(DataError::NotFound) => return Err(AppError::unauthorized("invalid password reset token")),
        Err(e) => return Err(e.into()),
    };

    let mut identity = tx.get_identity(claimed.identity_id).await?;
    users::set_password(tx, &identity, password, false, cost).await?;
    if !identity.verified {
        identity.verified = true;
        identity.updated_at = now;
        tx.update_identity(&identity).await?;
    }
    Ok(identity)
}

/// Creates a verification token for `identity` and returns the link to mail.
pub async fn start_verification(
    tx: &mut dyn Transaction,
    identity: &Identity,
    domain: &str,
    redirect: &str,
) -> Result<String, AppError> {
    let mut token = EmailVerificationToken::new(identity.id, verification_ttl());
    tx.create_email_verification_token(&mut token).await?;
    Ok(verification_link(domain, &token.token, redirect))
}

pub async fn verify_email(tx: &mut dyn Transaction, token: &str, now: DateTime<Utc>) -> Result<Identity, AppError> {
    let claimed = match tx.claim_email_verification_token(token, now).await {
        Ok(claimed) => claimed,
        Err(DataError::NotFound) => return Err(AppError::not_found()),
        Err(e) => return Err(e.into()),
    };
    let mut identity = tx.get_identity(claimed.identity_id).await?;
    identity.verified = true;
    identity.updated_at = now;
    tx.update_identity(&identity).await?;
    tracing::info!(user_id = %identity.id, "Verified email address");
    Ok(identity)
}
