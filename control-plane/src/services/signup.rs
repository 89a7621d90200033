use chrono::Utc;
use service_core::error::AppError;

use crate::config::SignupConfig;
use crate::data::{optional, Transaction};
use crate::models::grant::{RESOURCE_INFRA, ROLE_ADMIN};
use crate::models::{Grant, Identity, Organization, Subject};
use crate::services::email::EmailProvider;
use crate::services::login::{Authenticator, LoginResult};
use crate::services::{organizations, password_reset, users};
use crate::utils::PasswordPolicy;

/// Consumer mail domains are never trusted for automatic provisioning.
const SHARED_MAIL_DOMAINS: &[&str] = &["gmail.com", "googlemail.com"];

#[derive(Debug, Clone)]
pub struct SignupInput {
    pub org_name: String,
    pub subdomain: String,
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SignedUp {
    pub organization: Organization,
    pub login: LoginResult,
}

fn email_domain(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_lowercase())
        .filter(|domain| !domain.is_empty())
}

/// Creates an organization under the base domain together with its first
/// admin and a session for that admin. The verification email is best
/// effort: the account works before the address is confirmed.
pub async fn signup(
    tx: &mut dyn Transaction,
    input: SignupInput,
    config: &SignupConfig,
    policy: &PasswordPolicy,
    auth: &Authenticator<'_>,
    email: &dyn EmailProvider,
) -> Result<SignedUp, AppError> {
    if !config.enabled {
        return Err(AppError::bad_request("signup is disabled"));
    }
    policy.check("user.password", &input.password)?;

    let domain = format!("{}.{}", input.subdomain.to_lowercase(), config.base_domain);
    if optional(tx.get_organization_by_domain(&domain).await)?.is_some() {
        return Err(AppError::Conflict {
            field: Some("org.subDomain".to_string()),
            message: "an organization with that domain already exists".to_string(),
        });
    }

    let mut org = Organization::new(input.org_name.clone(), domain, Default::default());
    if let Some(admin_domain) = email_domain(&input.user_name) {
        if !SHARED_MAIL_DOMAINS.contains(&admin_domain.as_str()) {
            org.allowed_domains.push(admin_domain);
        }
    }
    organizations::create(tx, &mut org).await?;

    let mut admin = Identity::new(input.user_name.clone(), Default::default());
    tx.create_identity(&mut admin).await?;
    users::set_password(tx, &admin, &input.password, false, auth.bcrypt_cost).await?;

    let mut grant = Grant::new(Subject::User(admin.id), ROLE_ADMIN, RESOURCE_INFRA);
    grant.created_by = admin.id;
    tx.create_grant(&mut grant).await?;

    let link = password_reset::start_verification(tx, &admin, &org.domain, "/").await?;
    if let Err(e) = email.send_email_verification(&admin.name, &link).await {
        tracing::warn!(user_id = %admin.id, error = %e, "Failed to send verification email");
    }

    let infra = tx.get_infra_provider().await?;
    let expires_at = auth.session_expiry(Utc::now());
    let login = auth.start_session(tx, admin, infra.id, expires_at, false).await?;

    tracing::info!(org_id = %org.id, user_id = %login.identity.id, "Signed up");
    Ok(SignedUp {
        organization: org,
        login,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::data::{ListGrantsOptions, MemoryStore, Store, TxOptions};
    use crate::services::access_keys;
    use crate::services::crypto::Sealer;
    use crate::services::email::{EmailKind, MockEmailService};
    use crate::services::limiter::Limiter;
    use crate::services::oidc::OidcClient;
    use std::time::Duration;

    fn signup_config() -> SignupConfig {
        SignupConfig {
            enabled: true,
            base_domain: "example.com".to_string(),
            default_org_name: "Default".to_string(),
            default_org_domain: "localhost".to_string(),
        }
    }

    fn input(subdomain: &str, user: &str) -> SignupInput {
        SignupInput {
            org_name: "Acme".to_string(),
            subdomain: subdomain.to_string(),
            user_name: user.to_string(),
            password: "balloons1".to_string(),
        }
    }

    #[tokio::test]
    async fn signup_creates_org_admin_and_session() {
        let config = ServerConfig::for_tests();
        let limiter = Limiter::in_memory(config.rate_limit.clone());
        let oidc = OidcClient::new(Duration::from_secs(1)).unwrap();
        let sealer = Sealer::ephemeral();
        let auth = Authenticator {
            limiter: &limiter,
            oidc: &oidc,
            sealer: &sealer,
            session: &config.session,
            bcrypt_cost: 4,
        };
        let mail = MockEmailService::new();
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();

        let done = signup(
            tx.as_mut(),
            input("Acme", "admin@acme.io"),
            &signup_config(),
            &PasswordPolicy::default(),
            &auth,
            &mail,
        )
        .await
        .unwrap();

        assert_eq!(done.organization.domain, "acme.example.com");
        assert_eq!(done.organization.allowed_domains, vec!["acme.io".to_string()]);
        assert_eq!(done.login.organization_name, "Acme");
        let grants = tx
            .list_grants(&ListGrantsOptions {
                subjects: vec![Subject::User(done.login.identity.id)],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(grants.items[0].privilege, ROLE_ADMIN);
        assert!(access_keys::validate(tx.as_mut(), &done.login.issued.bearer, Utc::now())
            .await
            .is_ok());
        assert_eq!(mail.last_to("admin@acme.io").unwrap().kind, EmailKind::Verification);

        let err = signup(
            tx.as_mut(),
            input("acme", "other@gmail.com"),
            &signup_config(),
            &PasswordPolicy::default(),
            &auth,
            &mail,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));
    }

    #[tokio::test]
    async fn disabled_signup_is_rejected() {
        let config = ServerConfig::for_tests();
        let limiter = Limiter::in_memory(config.rate_limit.clone());
        let oidc = OidcClient::new(Duration::from_secs(1)).unwrap();
        let sealer = Sealer::ephemeral();
        let auth = Authenticator {
            limiter: &limiter,
            oidc: &oidc,
            sealer: &sealer,
            session: &config.session,
            bcrypt_cost: 4,
        };
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut disabled = signup_config();
        disabled.enabled = false;

        let err = signup(
            tx.as_mut(),
            input("acme", "admin@gmail.com"),
            &disabled,
            &PasswordPolicy::default(),
            &auth,
            &MockEmailService::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn shared_mail_domains_are_not_allowed_domains() {
        assert_eq!(email_domain("a@GMAIL.com").as_deref(), Some("gmail.com"));
        assert!(email_domain("nobody").is_none());
    }
}
