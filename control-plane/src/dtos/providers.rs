use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use super::PageRequest;
use crate::models::{self, ProviderKind};
use crate::services::providers::{ProviderApi, ProviderInput};
use crate::uid::Id;
use crate::utils::validation::{string_problems, StringRule, ALPHANUMERIC, DASH, DIGITS, DOT, LOWER, UNDERSCORE, UPPER};
use crate::utils::Rules;

const MAX_ALLOWED_DOMAINS: usize = 20;

const ALLOWED_DOMAIN: StringRule = StringRule {
    min_length: 0,
    max_length: 254,
    chars: &[LOWER, UPPER, DIGITS, DASH, DOT, UNDERSCORE],
    first_chars: ALPHANUMERIC,
};

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    #[schema(value_type = String)]
    pub id: Id,
    #[schema(example = "okta")]
    pub name: String,
    #[serde(with = "super::time")]
    pub created: DateTime<Utc>,
    #[serde(with = "super::time")]
    pub updated: DateTime<Utc>,
    #[schema(example = "example.okta.com")]
    pub url: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[schema(example = "oidc")]
    pub kind: String,
    #[serde(rename = "authURL")]
    pub auth_url: String,
    pub scopes: Vec<String>,
    pub allowed_domains: Vec<String>,
}

impl From<models::Provider> for Provider {
    fn from(provider: models::Provider) -> Self {
        Self {
            id: provider.id,
            name: provider.name,
            created: provider.created_at,
            updated: provider.updated_at,
            url: provider.url,
            client_id: provider.client_id,
            kind: provider.kind.to_string(),
            auth_url: provider.auth_url,
            scopes: provider.scopes,
            allowed_domains: provider.allowed_domains,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListProvidersRequest {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub page: PageRequest,
}

impl Validate for ListProvidersRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        self.page.check(&mut rules);
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderApiCredentials {
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub client_email: String,
    #[serde(default)]
    pub domain_admin_email: String,
}

/// Body of create and full update.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    #[serde(default)]
    #[schema(value_type = String)]
    pub id: Id,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "clientID")]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub api: Option<ProviderApiCredentials>,
}

impl ProviderRequest {
    pub fn into_input(self) -> ProviderInput {
        ProviderInput {
            name: self.name,
            kind: if self.kind.is_empty() {
                ProviderKind::Oidc.to_string()
            } else {
                self.kind
            },
            url: self.url,
            client_id: self.client_id,
            client_secret: self.client_secret,
            allowed_domains: self.allowed_domains,
            api: self.api.map(|api| ProviderApi {
                private_key: api.private_key,
                client_email: api.client_email,
                domain_admin_email: api.domain_admin_email,
            }),
        }
    }
}

impl Validate for ProviderRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .required("name", !self.name.is_empty())
            .name("name", &self.name)
            .required("url", !self.url.is_empty())
            .required("clientID", !self.client_id.is_empty())
            .required("clientSecret", !self.client_secret.is_empty())
            .enumeration("kind", &self.kind, &ProviderKind::EXTERNAL);
        if self.allowed_domains.len() > MAX_ALLOWED_DOMAINS {
            rules.fail("allowedDomains", format!("must have at most {} items", MAX_ALLOWED_DOMAINS));
        }
        for domain in &self.allowed_domains {
            for problem in string_problems(&ALLOWED_DOMAIN, domain) {
                rules.fail("allowedDomains", problem);
            }
        }
        if let Some(api) = &self.api {
            rules
                .email("api.clientEmail", &api.client_email)
                .email("api.domainAdminEmail", &api.domain_admin_email);
        }
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchProviderRequest {
    #[serde(default)]
    #[schema(value_type = String)]
    pub id: Id,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub client_secret: String,
}

impl Validate for PatchProviderRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules.required("id", !self.id.is_zero()).require_any_of(&[
            ("name", !self.name.is_empty()),
            ("clientSecret", !self.client_secret.is_empty()),
        ]);
        if !self.name.is_empty() {
            rules.name("name", &self.name);
        }
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderPath {
    #[serde(default)]
    pub id: Id,
}

impl Validate for ProviderPath {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new().required("id", !self.id.is_zero()).finish()
    }
}
