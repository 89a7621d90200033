use service_core::error::AppError;
use std::sync::Arc;

use crate::config::SignupConfig;
use crate::data::{DataError, Store, Transaction, TxOptions};
use crate::models::grant::{RESOURCE_INFRA, ROLE_CONNECTOR};
use crate::models::identity::CONNECTOR_IDENTITY_NAME;
use crate::models::provider::INFRA_PROVIDER_NAME;
use crate::models::{Grant, Identity, Organization, Provider, ProviderKind, Subject};

/// Creates `org` and the records every organization starts with: the `infra`
/// provider, the `connector` identity and its connector grant. Leaves the
/// transaction scoped to the new organization.
pub async fn create(tx: &mut dyn Transaction, org: &mut Organization) -> Result<(), AppError> {
    tx.create_organization(org).await?;
    tx.set_organization_id(Some(org.id));

    let mut provider = Provider::new(INFRA_PROVIDER_NAME, ProviderKind::Infra);
    provider.created_by = org.created_by;
    tx.create_provider(&mut provider).await?;

    let mut connector = Identity::new(CONNECTOR_IDENTITY_NAME, org.created_by);
    connector.verified = true;
    tx.create_identity(&mut connector).await?;

    let mut grant = Grant::new(Subject::User(connector.id), ROLE_CONNECTOR, RESOURCE_INFRA);
    grant.created_by = org.created_by;
    tx.create_grant(&mut grant).await?;

    tracing::info!(org_id = %org.id, domain = %org.domain, "Created organization");
    Ok(())
}

/// Returns the organization used when no host matches, creating it on first start.
pub async fn ensure_default(store: &Arc<dyn Store>, config: &SignupConfig) -> Result<Organization, AppError> {
    let mut tx = store.begin(TxOptions::read_write()).await?;
    let org = match tx.get_organization_by_domain(&config.default_org_domain).await {
        Ok(org) => org,
        Err(DataError::NotFound) => {
            let mut org = Organization::new(
                config.default_org_name.clone(),
                config.default_org_domain.clone(),
                Default::default(),
            );
            create(tx.as_mut(), &mut org).await?;
            org
        }
        Err(e) => return Err(e.into()),
    };
    tx.commit().await?;
    Ok(org)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ListGrantsOptions, MemoryStore};

    fn signup_config() -> SignupConfig {
        SignupConfig {
            enabled: false,
            base_domain: String::new(),
            default_org_name: "Default".to_string(),
            default_org_domain: "localhost".to_string(),
        }
    }

    #[tokio::test]
    async fn creates_bootstrap_records() {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new("acme", "acme.example.com", Default::default());
        create(tx.as_mut(), &mut org).await.unwrap();

        assert_eq!(tx.organization_id(), Some(org.id));
        let provider = tx.get_infra_provider().await.unwrap();
        assert_eq!(provider.kind, ProviderKind::Infra);
        let connector = tx.get_identity_by_name(CONNECTOR_IDENTITY_NAME).await.unwrap();
        assert!(connector.is_connector());

        let grants = tx.list_grants(&ListGrantsOptions::default()).await.unwrap();
        assert_eq!(grants.items.len(), 1);
        assert_eq!(grants.items[0].privilege, ROLE_CONNECTOR);
        let hidden = tx
            .list_grants(&ListGrantsOptions {
                exclude_connector: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(hidden.items.is_empty());
    }

    #[tokio::test]
    async fn default_organization_is_created_once() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = ensure_default(&store, &signup_config()).await.unwrap();
        let second = ensure_default(&store, &signup_config()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.domain, "localhost");
    }
}
