use service_core::error::AppError;

use crate::data::{optional, ListProvidersOptions, Paged, Transaction};
use crate::models::{Provider, ProviderKind};
use crate::services::crypto::Sealer;
use crate::services::oidc::OidcClient;
use crate::uid::Id;
use crate::utils::generate;

const NAME_SUFFIX_LENGTH: usize = 6;

/// Service-account settings used by providers that sync directory groups.
#[derive(Debug, Clone, Default)]
pub struct ProviderApi {
    pub private_key: String,
    pub client_email: String,
    pub domain_admin_email: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderInput {
    pub name: String,
    pub kind: String,
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    pub allowed_domains: Vec<String>,
    pub api: Option<ProviderApi>,
}

/// Trims whitespace and turns an Okta admin console URL into the org URL.
fn clean_url(url: &str) -> String {
    url.trim().replace("-admin.okta.com", ".okta.com")
}

fn parse_kind(kind: &str) -> Result<ProviderKind, AppError> {
    match kind.parse::<ProviderKind>() {
        Ok(ProviderKind::Infra) | Err(_) => Err(AppError::field(
            "kind",
            format!("must be one of ({})", ProviderKind::EXTERNAL.join(", ")),
        )),
        Ok(kind) => Ok(kind),
    }
}

fn apply(provider: &mut Provider, input: ProviderInput, sealer: &Sealer) -> Result<(), AppError> {
    provider.url = clean_url(&input.url);
    provider.client_id = input.client_id;
    provider.client_secret = sealer.seal(&input.client_secret)?;
    provider.allowed_domains = input.allowed_domains;
    if let Some(api) = input.api {
        // PEM newlines arrive escaped
        provider.private_key = sealer.seal(&api.private_key.replace("\\n", "\n"))?;
        provider.client_email = api.client_email;
        provider.domain_admin_email = api.domain_admin_email;
    }
    Ok(())
}

/// Lists external providers; the built-in `infra` provider is never listed.
pub async fn list(tx: &mut dyn Transaction, mut opts: ListProvidersOptions) -> Result<Paged<Provider>, AppError> {
    opts.exclude_infra = true;
    Ok(tx.list_providers(&opts).await?)
}

pub async fn get(tx: &mut dyn Transaction, id: Id) -> Result<Provider, AppError> {
    Ok(tx.get_provider(id).await?)
}

pub async fn create(
    tx: &mut dyn Transaction,
    input: ProviderInput,
    created_by: Id,
    sealer: &Sealer,
) -> Result<Provider, AppError> {
    let kind = parse_kind(&input.kind)?;
    let mut name = input.name.trim().to_string();
    if name.is_empty() {
        name = kind.as_str().to_string();
        if optional(tx.get_provider_by_name(&name).await)?.is_some() {
            name = format!(
                "{}-{}",
                kind.as_str(),
                generate::alphanumeric(NAME_SUFFIX_LENGTH).to_lowercase()
            );
        }
    }

    let mut provider = Provider::new(name, kind);
    provider.created_by = created_by;
    apply(&mut provider, input, sealer)?;
    tx.create_provider(&mut provider).await?;
    tracing::info!(provider_id = %provider.id, kind = %kind, "Created provider");
    Ok(provider)
}

/// Replaces the provider's settings.
pub async fn update(
    tx: &mut dyn Transaction,
    id: Id,
    input: ProviderInput,
    sealer: &Sealer,
    oidc: &OidcClient,
) -> Result<Provider, AppError> {
    let mut provider = tx.get_provider(id).await?;
    if provider.kind == ProviderKind::Infra {
        return Err(AppError::bad_request("the infra provider cannot be modified"));
    }
    provider.kind = parse_kind(&input.kind)?;
    if !input.name.trim().is_empty() {
        provider.name = input.name.trim().to_string();
    }
    apply(&mut provider, input, sealer)?;
    provider.updated_at = chrono::Utc::now();
    tx.update_provider(&provider).await?;
    oidc.invalidate(id);
    Ok(provider)
}

/// Changes only the fields that are set.
pub async fn patch(
    tx: &mut dyn Transaction,
    id: Id,
    name: Option<String>,
    client_secret: Option<String>,
    sealer: &Sealer,
    oidc: &OidcClient,
) -> Result<Provider, AppError> {
    let mut provider = tx.get_provider(id).await?;
    if provider.kind == ProviderKind::Infra {
        return Err(AppError::bad_request("the infra provider cannot be modified"));
    }
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        provider.name = name;
    }
    if let Some(secret) = client_secret.filter(|s| !s.is_empty()) {
        provider.client_secret = sealer.seal(&secret)?;
    }
    provider.updated_at = chrono::Utc::now();
    tx.update_provider(&provider).await?;
    oidc.invalidate(id);
    Ok(provider)
}

/// Deletes the provider, its user links and every key it issued.
pub async fn delete(tx: &mut dyn Transaction, id: Id, oidc: &OidcClient) -> Result<(), AppError> {
    let provider = tx.get_provider(id).await?;
    if provider.kind == ProviderKind::Infra {
        return Err(AppError::bad_request("the infra provider cannot be deleted"));
    }
    let keys = tx.delete_access_keys_for_provider(id).await?;
    let users = tx.delete_provider_users_for_provider(id).await?;
    tx.delete_provider(id).await?;
    oidc.invalidate(id);
    tracing::info!(provider_id = %id, keys, users, "Deleted provider");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryStore, Store, TxOptions};
    use crate::models::Organization;
    use crate::services::organizations;
    use std::time::Duration;

    async fn setup() -> Box<dyn Transaction> {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new("acme", "acme.example.com", Id(0));
        organizations::create(tx.as_mut(), &mut org).await.unwrap();
        tx
    }

    fn input(kind: &str) -> ProviderInput {
        ProviderInput {
            kind: kind.to_string(),
            url: " example-admin.okta.com ".to_string(),
            client_id: "client".to_string(),
            client_secret: "hunter2".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_seals_secret_and_names_by_kind() {
        let mut tx = setup().await;
        let sealer = Sealer::ephemeral();
        let first = create(tx.as_mut(), input("okta"), Id(0), &sealer).await.unwrap();
        assert_eq!(first.name, "okta");
        assert_eq!(first.url, "example.okta.com");
        assert_ne!(first.client_secret, "hunter2");
        assert_eq!(sealer.open(&first.client_secret).unwrap(), "hunter2");

        let second = create(tx.as_mut(), input("okta"), Id(0), &sealer).await.unwrap();
        assert!(second.name.starts_with("okta-"));
    }

    #[tokio::test]
    async fn infra_is_hidden_and_protected() {
        let mut tx = setup().await;
        let oidc = OidcClient::new(Duration::from_secs(1)).unwrap();
        let infra = tx.get_infra_provider().await.unwrap();

        let page = list(tx.as_mut(), ListProvidersOptions::default()).await.unwrap();
        assert_eq!(page.total_count, 0);
        assert!(delete(tx.as_mut(), infra.id, &oidc).await.is_err());
        assert!(create(tx.as_mut(), input("infra"), Id(0), &Sealer::ephemeral()).await.is_err());
    }
}
