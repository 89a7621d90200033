use chrono::Duration;
use service_core::error::AppError;

use crate::data::{optional, DataError, ListIdentitiesOptions, Paged, Transaction};
use crate::models::access_key::SCOPE_PASSWORD_RESET;
use crate::models::{AccessKey, Credential, Identity, Organization, PasswordResetToken, ProviderUser, Subject};
use crate::services::email::EmailProvider;
use crate::uid::Id;
use crate::utils::{generate, hash_secret_blocking, verify_secret_blocking, PasswordPolicy};

const ONE_TIME_PASSWORD_LENGTH: usize = 12;

/// How long an emailed invite stays valid.
pub fn invite_ttl() -> Duration {
    Duration::hours(72)
}

#[derive(Debug, Clone)]
pub struct CreatedUser {
    pub identity: Identity,
    /// Set when no invite email was sent.
    pub one_time_password: Option<String>,
}

pub async fn list(
    tx: &mut dyn Transaction,
    opts: &ListIdentitiesOptions,
    show_system: bool,
) -> Result<Paged<Identity>, AppError> {
    let mut page = tx.list_identities(opts).await?;
    if !show_system {
        let before = page.items.len();
        page.items.retain(|i| !i.is_connector());
        page.total_count -= (before - page.items.len()) as i64;
    }
    Ok(page)
}

pub async fn get(tx: &mut dyn Transaction, id: Id) -> Result<Identity, AppError> {
    Ok(tx.get_identity(id).await?)
}

/// Links `identity` to the organization's `infra` provider and stores a
/// password credential for it.
async fn create_credential(
    tx: &mut dyn Transaction,
    identity: &Identity,
    password: &str,
    one_time: bool,
    cost: u32,
) -> Result<(), AppError> {
    let hash = hash_secret_blocking(password.to_string(), cost).await?;
    let mut credential = Credential::new(identity.id, hash, one_time);
    tx.create_credential(&mut credential).await?;

    let infra = tx.get_infra_provider().await?;
    let mut link = ProviderUser::new(identity.id, infra.id, identity.name.clone());
    tx.upsert_provider_user(&mut link).await?;
    Ok(())
}

/// Sets a password on `identity`, creating the credential when none exists.
pub async fn set_password(
    tx: &mut dyn Transaction,
    identity: &Identity,
    password: &str,
    one_time: bool,
    cost: u32,
) -> Result<(), AppError> {
    match optional(tx.get_credential(identity.id).await)? {
        Some(mut credential) => {
            credential.password_hash = hash_secret_blocking(password.to_string(), cost).await?;
            credential.one_time_password = one_time;
            tx.update_credential(&credential).await?;
            Ok(())
        }
        None => create_credential(tx, identity, password, one_time, cost).await,
    }
}

/// Creates an `infra` user. With email configured the user gets an invite
/// link; otherwise the response carries a one-time password.
pub async fn create(
    tx: &mut dyn Transaction,
    name: &str,
    org: &Organization,
    inviter: &Identity,
    email: &dyn EmailProvider,
    cost: u32,
) -> Result<CreatedUser, AppError> {
    let identity = match tx.get_identity_by_name(name).await {
        Ok(existing) => {
            let infra = tx.get_infra_provider().await?;
            if optional(tx.get_provider_user(infra.id, existing.id).await)?.is_some() {
                return Err(AppError::bad_request("user already exists"));
            }
            existing
        }
        Err(DataError::NotFound) => {
            let mut identity = Identity::new(name, inviter.id);
            tx.create_identity(&mut identity).await?;
            identity
        }
        Err(e) => return Err(e.into()),
    };

    if email.is_configured() {
        let mut token = PasswordResetToken::new(identity.id, invite_ttl());
        tx.create_password_reset_token(&mut token).await?;
        let link = format!("https://{}/accept-invite?token={}", org.domain, token.token);
        email.send_user_invite(&identity.name, &inviter.name, &link).await?;
        tracing::info!(user_id = %identity.id, "Sent user invite");
        return Ok(CreatedUser {
            identity,
            one_time_password: None,
        });
    }

    let password = generate::alphanumeric(ONE_TIME_PASSWORD_LENGTH);
    create_credential(tx, &identity, &password, true, cost).await?;
    Ok(CreatedUser {
        identity,
        one_time_password: Some(password),
    })
}

/// A user changing their own password. Clears the one-time flag and drops the
/// `password_reset` scope from the key used for the request.
pub async fn change_password(
    tx: &mut dyn Transaction,
    identity: &Identity,
    current_key: Option<&AccessKey>,
    old_password: &str,
    new_password: &str,
    policy: &PasswordPolicy,
    cost: u32,
) -> Result<(), AppError> {
    let mut credential = tx.get_credential(identity.id).await?;
    if !verify_secret_blocking(old_password.to_string(), credential.password_hash.clone()).await {
        return Err(AppError::field("oldPassword", "invalid password"));
    }
    policy.check("password", new_password)?;

    credential.password_hash = hash_secret_blocking(new_password.to_string(), cost).await?;
    credential.one_time_password = false;
    tx.update_credential(&credential).await?;

    if let Some(key) = current_key {
        if key.has_scope(SCOPE_PASSWORD_RESET) {
            let mut key = key.clone();
            key.scopes.retain(|s| s != SCOPE_PASSWORD_RESET);
            tx.update_access_key(&key).await?;
        }
    }
    Ok(())
}

/// An admin setting another user's password. The result is always one-time;
/// a random one is generated when `password` is empty.
pub async fn reset_password(
    tx: &mut dyn Transaction,
    identity: &Identity,
    password: &str,
    cost: u32,
) -> Result<String, AppError> {
    let password = if password.is_empty() {
        generate::alphanumeric(ONE_TIME_PASSWORD_LENGTH)
    } else {
        password.to_string()
    };
    set_password(tx, identity, &password, true, cost).await?;
    Ok(password)
}

pub async fn delete(tx: &mut dyn Transaction, id: Id, caller: Id) -> Result<(), AppError> {
    if id == caller {
        return Err(AppError::bad_request("cannot delete own user"));
    }
    let identity = tx.get_identity(id).await?;
    if identity.is_connector() {
        return Err(AppError::bad_request("cannot delete connector user"));
    }

    tx.delete_access_keys_for_identity(id).await?;
    tx.delete_grants_for_subject(Subject::User(id)).await?;
    tx.delete_provider_users_for_identity(id).await?;
    optional(tx.delete_credential(id).await)?;
    tx.delete_identity(id).await?;
    tracing::info!(user_id = %id, "Deleted user");
    Ok(())
}
