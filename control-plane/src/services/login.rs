//! Login: turns a password, an exchangeable access key or an OIDC
//! authorization code into a new session key.

use chrono::{DateTime, Utc};
use service_core::error::AppError;

use crate::config::SessionConfig;
use crate::data::{optional, DataError, ListAccessKeysOptions, Transaction};
use crate::models::access_key::{
    SCOPE_ALLOW_APPROVE_DEVICE_FLOW, SCOPE_ALLOW_CREATE_ACCESS_KEY, SCOPE_PASSWORD_RESET,
};
use crate::models::{AccessKey, Group, Identity, Provider, ProviderKind, ProviderUser};
use crate::services::access_keys::{self, IssuedKey};
use crate::services::crypto::Sealer;
use crate::services::limiter::Limiter;
use crate::services::oidc::{OidcClient, REFRESH_WINDOW};
use crate::uid::Id;
use crate::utils::verify_secret_blocking;

pub enum LoginMethod {
    Password { name: String, password: String },
    AccessKey { bearer: String },
    Oidc { provider_id: Id, code: String, redirect_url: String },
}

impl LoginMethod {
    fn name(&self) -> &'static str {
        match self {
            LoginMethod::Password { .. } => "password",
            LoginMethod::AccessKey { .. } => "access_key",
            LoginMethod::Oidc { .. } => "oidc",
        }
    }
}

/// What a login needs beyond the transaction.
pub struct Authenticator<'a> {
    pub limiter: &'a Limiter,
    pub oidc: &'a OidcClient,
    pub sealer: &'a Sealer,
    pub session: &'a SessionConfig,
    pub bcrypt_cost: u32,
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub issued: IssuedKey,
    pub identity: Identity,
    pub password_update_required: bool,
    pub organization_name: String,
}

/// Who authenticated, and how the session key must be shaped.
struct Authenticated {
    identity: Identity,
    provider_id: Id,
    expires_at: DateTime<Utc>,
    password_reset_only: bool,
}

/// A failed login. `Revoked` carries writes that must outlive the failure:
/// the keys deleted because the provider ended the user's session.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error(transparent)]
    Failed(#[from] AppError),
    #[error("provider session is no longer valid")]
    Revoked,
}

impl From<DataError> for LoginError {
    fn from(err: DataError) -> Self {
        LoginError::Failed(err.into())
    }
}

impl From<LoginError> for AppError {
    fn from(err: LoginError) -> Self {
        match err {
            LoginError::Failed(err) => err,
            LoginError::Revoked => AppError::unauthorized("provider session is no longer valid"),
        }
    }
}

fn login_failed() -> AppError {
    AppError::unauthorized("login failed")
}

impl<'a> Authenticator<'a> {
    pub async fn login(&self, tx: &mut dyn Transaction, method: LoginMethod) -> Result<LoginResult, LoginError> {
        let now = Utc::now();
        let method_name = method.name();
        let authenticated = match method {
            LoginMethod::Password { name, password } => self.password(tx, &name, &password, now).await?,
            LoginMethod::AccessKey { bearer } => self.exchange(tx, &bearer, now).await?,
            LoginMethod::Oidc {
                provider_id,
                code,
                redirect_url,
            } => self.oidc(tx, provider_id, &code, &redirect_url, now).await?,
        };

        let Authenticated {
            identity,
            provider_id,
            expires_at,
            password_reset_only,
        } = authenticated;
        let result = self
            .start_session(tx, identity, provider_id, expires_at, password_reset_only)
            .await?;
        tracing::info!(user_id = %result.identity.id, method = method_name, "Login succeeded");
        Ok(result)
    }

    /// Issues a session key for an identity that has already authenticated.
    pub async fn start_session(
        &self,
        tx: &mut dyn Transaction,
        mut identity: Identity,
        provider_id: Id,
        expires_at: DateTime<Utc>,
        password_reset_only: bool,
    ) -> Result<LoginResult, AppError> {
        let now = Utc::now();
        let mut key = AccessKey::new(identity.id, provider_id);
        key.id = Id::new();
        key.name = format!("{}-{}", identity.name, key.id);
        key.expires_at = expires_at;
        key.inactivity_extension = self.session.inactivity_timeout;
        key.scopes = vec![
            SCOPE_ALLOW_CREATE_ACCESS_KEY.to_string(),
            SCOPE_ALLOW_APPROVE_DEVICE_FLOW.to_string(),
        ];
        if password_reset_only {
            key.scopes.push(SCOPE_PASSWORD_RESET.to_string());
        }
        let issued = access_keys::issue(tx, key, self.bcrypt_cost).await?;

        identity.last_seen_at = Some(now);
        tx.update_identity_last_seen(identity.id, now).await?;

        let org_id = tx
            .organization_id()
            .ok_or_else(|| AppError::from(DataError::OrganizationRequired))?;
        let org = tx.get_organization(org_id).await?;

        Ok(LoginResult {
            issued,
            identity,
            password_update_required: password_reset_only,
            organization_name: org.name,
        })
    }

    pub fn session_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.session.duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn password(
        &self,
        tx: &mut dyn Transaction,
        name: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<Authenticated, AppError> {
        let org_id = tx.organization_id().unwrap_or_default();
        self.limiter.check_login_attempt(name, org_id).await?;
        self.limiter.check_lockout(name, org_id).await?;

        let identity = match optional(tx.get_identity_by_name(name).await)? {
            Some(identity) => identity,
            None => {
                self.limiter.login_failed(name, org_id).await?;
                return Err(login_failed());
            }
        };
        let credential = match optional(tx.get_credential(identity.id).await)? {
            Some(credential) => credential,
            None => {
                self.limiter.login_failed(name, org_id).await?;
                return Err(login_failed());
            }
        };
        if !verify_secret_blocking(password.to_string(), credential.password_hash.clone()).await {
            self.limiter.login_failed(name, org_id).await?;
            return Err(login_failed());
        }
        self.limiter.login_succeeded(name, org_id).await?;

        let infra = tx.get_infra_provider().await?;
        Ok(Authenticated {
            identity,
            provider_id: infra.id,
            expires_at: self.session_expiry(now),
            password_reset_only: credential.one_time_password,
        })
    }

    /// Trades a key carrying `allow_create_access_key` for a session key that
    /// can outlive neither the old key nor the session duration.
    async fn exchange(
        &self,
        tx: &mut dyn Transaction,
        bearer: &str,
        now: DateTime<Utc>,
    ) -> Result<Authenticated, LoginError> {
        let key = access_keys::validate(tx, bearer, now).await?;
        if Some(key.organization_id) != tx.organization_id() {
            return Err(AppError::unauthorized("access key belongs to another organization").into());
        }
        if !key.has_scope(SCOPE_ALLOW_CREATE_ACCESS_KEY) {
            return Err(AppError::unauthorized("access key cannot be exchanged").into());
        }

        let identity = tx.get_identity(key.issued_for).await?;
        let provider = tx.get_provider(key.provider_id).await?;
        if provider.kind != ProviderKind::Infra {
            self.check_provider_session(tx, &provider, &identity, now).await?;
        }

        Ok(Authenticated {
            identity,
            provider_id: key.provider_id,
            expires_at: key.expires_at.min(self.session_expiry(now)),
            password_reset_only: false,
        })
    }

    /// Refreshes the stored provider tokens when they are close to expiry.
    /// A refused refresh means the user was revoked upstream: their keys
    /// from this provider are deleted.
    async fn check_provider_session(
        &self,
        tx: &mut dyn Transaction,
        provider: &Provider,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<(), LoginError> {
        let mut link = match optional(tx.get_provider_user(provider.id, identity.id).await)? {
            Some(link) => link,
            None => return Err(AppError::unauthorized("no session with the identity provider").into()),
        };
        if link.expires_at - now > REFRESH_WINDOW {
            return Ok(());
        }

        let secret = self.sealer.open(&provider.client_secret)?;
        let refresh_token = self.sealer.open(&link.refresh_token)?;
        match self.oidc.refresh(provider, &secret, &refresh_token).await {
            Ok((access_token, expires_at)) => {
                link.access_token = self.sealer.seal(&access_token)?;
                link.expires_at = expires_at;
                link.updated_at = now;
                tx.upsert_provider_user(&mut link).await?;
                tracing::debug!(provider_id = %provider.id, user_id = %identity.id, "Refreshed provider token");
                Ok(())
            }
            Err(AppError::BadGateway(message)) => Err(AppError::BadGateway(message).into()),
            Err(err) => {
                tracing::info!(provider_id = %provider.id, user_id = %identity.id, error = %err, "Provider session revoked");
                self.revoke_provider_keys(tx, provider.id, identity.id).await?;
                Err(LoginError::Revoked)
            }
        }
    }

    async fn revoke_provider_keys(
        &self,
        tx: &mut dyn Transaction,
        provider_id: Id,
        identity_id: Id,
    ) -> Result<(), AppError> {
        let keys = tx
            .list_access_keys(&ListAccessKeysOptions {
                issued_for: Some(identity_id),
                include_expired: true,
                ..Default::default()
            })
            .await?;
        for key in keys.items.iter().filter(|k| k.provider_id == provider_id) {
            access_keys::revoke(tx, key.id).await?;
        }
        Ok(())
    }

    async fn oidc(
        &self,
        tx: &mut dyn Transaction,
        provider_id: Id,
        code: &str,
        redirect_url: &str,
        now: DateTime<Utc>,
    ) -> Result<Authenticated, AppError> {
        let provider = match tx.get_provider(provider_id).await {
            Ok(p) if p.kind != ProviderKind::Infra => p,
            Ok(_) | Err(DataError::NotFound) => return Err(login_failed()),
            Err(e) => return Err(e.into()),
        };
        let secret = self.sealer.open(&provider.client_secret)?;
        let tokens = self.oidc.exchange(&provider, &secret, code, redirect_url).await?;
        if tokens.email.is_empty() {
            return Err(AppError::unauthorized("id token has no email"));
        }
        if !email_domain_allowed(&provider.allowed_domains, &tokens.email) {
            return Err(AppError::unauthorized(format!(
                "{} is not an allowed email domain",
                tokens.email
            )));
        }
        let info = self.oidc.user_info(&provider, &tokens.access_token).await?;

        let identity = match optional(tx.get_identity_by_name(&tokens.email).await)? {
            Some(mut identity) => {
                if !identity.verified {
                    identity.verified = true;
                    tx.update_identity(&identity).await?;
                }
                identity
            }
            None => {
                let mut identity = Identity::new(tokens.email.clone(), provider.created_by);
                identity.verified = true;
                tx.create_identity(&mut identity).await?;
                identity
            }
        };

        let mut link = optional(tx.get_provider_user(provider.id, identity.id).await)?
            .unwrap_or_else(|| ProviderUser::new(identity.id, provider.id, tokens.email.clone()));
        link.email = tokens.email.clone();
        link.groups = info.groups.clone();
        link.redirect_url = redirect_url.to_string();
        link.access_token = self.sealer.seal(&tokens.access_token)?;
        link.refresh_token = self.sealer.seal(&tokens.refresh_token)?;
        link.expires_at = tokens.expires_at;
        link.last_update = now;
        link.updated_at = now;
        link.active = true;
        tx.upsert_provider_user(&mut link).await?;

        sync_groups(tx, &provider, &identity, &info.groups).await?;

        Ok(Authenticated {
            identity,
            provider_id: provider.id,
            expires_at: self.session_expiry(now),
            password_reset_only: false,
        })
    }
}

fn email_domain_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let domain = email.rsplit_once('@').map(|(_, d)| d).unwrap_or_default();
    allowed.iter().any(|a| a.eq_ignore_ascii_case(domain))
}

/// Mirrors the provider's group claims onto groups owned by that provider.
async fn sync_groups(
    tx: &mut dyn Transaction,
    provider: &Provider,
    identity: &Identity,
    names: &[String],
) -> Result<(), AppError> {
    for name in names {
        let group = match optional(tx.get_group_by_name(name).await)? {
            Some(group) => group,
            None => {
                let mut group = Group::new(name.clone(), provider.created_by);
                group.created_by_provider = provider.id;
                tx.create_group(&mut group).await?;
                group
            }
        };
        tx.add_users_to_group(group.id, &[identity.id]).await?;
    }

    for group_id in tx.list_group_ids_for_user(identity.id).await? {
        let group = tx.get_group(group_id).await?;
        if group.created_by_provider == provider.id && !names.contains(&group.name) {
            tx.remove_users_from_group(group_id, &[identity.id]).await?;
        }
    }
    Ok(())
}

/// Deletes the key that authenticated the request.
pub async fn logout(tx: &mut dyn Transaction, key: &AccessKey) -> Result<(), AppError> {
    access_keys::revoke(tx, key.id).await?;
    tracing::debug!(user_id = %key.issued_for, "Logged out");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::data::{MemoryStore, Store, TxOptions};
    use crate::models::Organization;
    use crate::services::{organizations, users};
    use std::time::Duration;

    struct Fixture {
        limiter: Limiter,
        oidc: OidcClient,
        sealer: Sealer,
        session: SessionConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let config = ServerConfig::for_tests();
            let mut rate_limit = config.rate_limit.clone();
            rate_limit.lockout_threshold = 2;
            Self {
                limiter: Limiter::in_memory(rate_limit),
                oidc: OidcClient::new(Duration::from_secs(1)).unwrap(),
                sealer: Sealer::ephemeral(),
                session: config.session.clone(),
            }
        }

        fn authenticator(&self) -> Authenticator<'_> {
            Authenticator {
                limiter: &self.limiter,
                oidc: &self.oidc,
                sealer: &self.sealer,
                session: &self.session,
                bcrypt_cost: 4,
            }
        }
    }

    async fn setup() -> (Box<dyn Transaction>, Identity) {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new("acme", "acme.example.com", Id(0));
        organizations::create(tx.as_mut(), &mut org).await.unwrap();
        let mut user = Identity::new("hubert@example.com", Id(0));
        tx.create_identity(&mut user).await.unwrap();
        users::set_password(tx.as_mut(), &user, "password1", false, 4).await.unwrap();
        (tx, user)
    }

    fn password(name: &str, password: &str) -> LoginMethod {
        LoginMethod::Password {
            name: name.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn password_login_issues_session_key() {
        let (mut tx, user) = setup().await;
        let fixture = Fixture::new();
        let result = fixture
            .authenticator()
            .login(tx.as_mut(), password("hubert@example.com", "password1"))
            .await
            .unwrap();

        assert_eq!(result.identity.id, user.id);
        assert!(!result.password_update_required);
        assert_eq!(result.organization_name, "acme");
        assert!(result.issued.key.has_scope(SCOPE_ALLOW_CREATE_ACCESS_KEY));
        let validated = access_keys::validate(tx.as_mut(), &result.issued.bearer, Utc::now())
            .await
            .unwrap();
        assert_eq!(validated.issued_for, user.id);
    }

    #[tokio::test]
    async fn one_time_password_restricts_session() {
        let (mut tx, user) = setup().await;
        users::set_password(tx.as_mut(), &user, "temporary1", true, 4).await.unwrap();
        let fixture = Fixture::new();
        let result = fixture
            .authenticator()
            .login(tx.as_mut(), password("hubert@example.com", "temporary1"))
            .await
            .unwrap();
        assert!(result.password_update_required);
        assert!(result.issued.key.has_scope(SCOPE_PASSWORD_RESET));
    }

    #[tokio::test]
    async fn repeated_failures_lock_the_account() {
        let (mut tx, _) = setup().await;
        let fixture = Fixture::new();
        let auth = fixture.authenticator();
        for _ in 0..2 {
            let err = auth
                .login(tx.as_mut(), password("hubert@example.com", "nope"))
                .await
                .map_err(AppError::from)
                .unwrap_err();
            assert!(matches!(err, AppError::Unauthorized(_)));
        }
        let err = auth
            .login(tx.as_mut(), password("hubert@example.com", "password1"))
            .await
            .map_err(AppError::from)
            .unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests(_, Some(_))));
    }

    #[tokio::test]
    async fn exchange_caps_expiry_at_the_old_key() {
        let (mut tx, user) = setup().await;
        let fixture = Fixture::new();
        let infra = tx.get_infra_provider().await.unwrap();

        let mut key = AccessKey::new(user.id, infra.id);
        key.name = "exchangeable".to_string();
        key.expires_at = Utc::now() + chrono::Duration::minutes(10);
        key.scopes = vec![SCOPE_ALLOW_CREATE_ACCESS_KEY.to_string()];
        let old = access_keys::issue(tx.as_mut(), key, 4).await.unwrap();

        let result = fixture
            .authenticator()
            .login(tx.as_mut(), LoginMethod::AccessKey { bearer: old.bearer })
            .await
            .unwrap();
        assert_eq!(result.issued.key.expires_at, old.key.expires_at);
    }

    #[tokio::test]
    async fn exchange_requires_scope() {
        let (mut tx, user) = setup().await;
        let fixture = Fixture::new();
        let infra = tx.get_infra_provider().await.unwrap();
        let mut key = AccessKey::new(user.id, infra.id);
        key.name = "plain".to_string();
        key.expires_at = Utc::now() + chrono::Duration::minutes(10);
        let old = access_keys::issue(tx.as_mut(), key, 4).await.unwrap();

        let err = fixture
            .authenticator()
            .login(tx.as_mut(), LoginMethod::AccessKey { bearer: old.bearer })
            .await
            .map_err(AppError::from)
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn allowed_domains() {
        assert!(email_domain_allowed(&[], "a@b.com"));
        assert!(email_domain_allowed(&["example.com".to_string()], "a@Example.com"));
        assert!(!email_domain_allowed(&["example.com".to_string()], "a@evil.com"));
    }
}
