use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::uid::Id;

/// Name of the built-in provider backed by local password credentials.
pub const INFRA_PROVIDER_NAME: &str = "infra";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Infra,
    Oidc,
    Okta,
    Azure,
    Google,
}

impl ProviderKind {
    /// Kinds that may be created through the API.
    pub const EXTERNAL: [&'static str; 4] = ["oidc", "okta", "azure", "google"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Infra => "infra",
            ProviderKind::Oidc => "oidc",
            ProviderKind::Okta => "okta",
            ProviderKind::Azure => "azure",
            ProviderKind::Google => "google",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "infra" => Ok(ProviderKind::Infra),
            "oidc" => Ok(ProviderKind::Oidc),
            "okta" => Ok(ProviderKind::Okta),
            "azure" => Ok(ProviderKind::Azure),
            "google" => Ok(ProviderKind::Google),
            _ => Err(format!("unknown provider kind: {}", s)),
        }
    }
}

/// An authentication source. Secret fields hold sealed ciphertext.
#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub kind: ProviderKind,
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub scopes: Vec<String>,
    pub allowed_domains: Vec<String>,
    pub private_key: String,
    pub client_email: String,
    pub domain_admin_email: String,
    pub created_by: Id,
}

impl Provider {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            name: name.into(),
            kind,
            url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            auth_url: String::new(),
            scopes: Vec::new(),
            allowed_domains: Vec::new(),
            private_key: String::new(),
            client_email: String::new(),
            domain_admin_email: String::new(),
            created_by: Id::default(),
        }
    }
}
