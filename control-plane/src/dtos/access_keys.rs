use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use super::PageRequest;
use crate::models::AccessKey;
use crate::uid::Id;
use crate::utils::{ApiDuration, Rules};

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessKeyView {
    #[schema(value_type = String, example = "4yJ3n3D8E2")]
    pub id: Id,
    #[serde(with = "super::time")]
    pub created: DateTime<Utc>,
    #[serde(with = "super::time")]
    pub last_used: DateTime<Utc>,
    #[schema(example = "cicdkey")]
    pub name: String,
    #[schema(example = "admin@example.com")]
    pub issued_for_name: String,
    #[schema(value_type = String)]
    pub issued_for: Id,
    #[serde(rename = "providerID")]
    #[schema(value_type = String)]
    pub provider_id: Id,
    #[serde(with = "super::time")]
    pub expires: DateTime<Utc>,
    /// The key must be used by this time to stay valid.
    #[serde(with = "super::time")]
    pub inactivity_timeout: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl From<AccessKey> for AccessKeyView {
    fn from(key: AccessKey) -> Self {
        Self {
            id: key.id,
            created: key.created_at,
            last_used: key.updated_at,
            name: key.name,
            issued_for_name: key.issued_for_name,
            issued_for: key.issued_for,
            provider_id: key.provider_id,
            expires: key.expires_at,
            inactivity_timeout: key.inactivity_timeout_at,
            scopes: key.scopes,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAccessKeysRequest {
    #[serde(default, rename = "userID")]
    pub user_id: Id,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "crate::api::binding::boolean")]
    pub show_expired: bool,
    #[serde(flatten)]
    pub page: PageRequest,
}

impl Validate for ListAccessKeysRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        self.page.check(&mut rules);
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccessKeyRequest {
    #[serde(default, rename = "userID")]
    #[schema(value_type = String)]
    pub user_id: Id,
    /// Defaults to `<user name>-<key id>`.
    #[serde(default)]
    #[schema(example = "cicdkey")]
    pub name: String,
    #[serde(default)]
    #[schema(value_type = String, example = "12h")]
    pub expiry: Option<ApiDuration>,
    #[serde(default)]
    #[schema(value_type = String, example = "1h")]
    pub inactivity_timeout: Option<ApiDuration>,
}

impl Validate for CreateAccessKeyRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules.required("userID", !self.user_id.is_zero());
        if !self.name.is_empty() {
            rules.name("name", &self.name);
        }
        if self.expiry.is_some_and(|d| d.is_zero()) {
            rules.fail("expiry", "must be greater than zero");
        }
        rules.finish()
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccessKeyResponse {
    #[schema(value_type = String)]
    pub id: Id,
    #[serde(with = "super::time")]
    pub created: DateTime<Utc>,
    pub name: String,
    #[schema(value_type = String)]
    pub issued_for: Id,
    #[serde(rename = "providerID")]
    #[schema(value_type = String)]
    pub provider_id: Id,
    #[serde(with = "super::time")]
    pub expires: DateTime<Utc>,
    #[serde(with = "super::time")]
    pub inactivity_timeout: DateTime<Utc>,
    /// Shown once; only its hash is stored.
    #[schema(example = "2vrEbqFEUr.jtTlxkgYdvghJNdEa2KkbgeQ")]
    pub access_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessKeyPath {
    #[serde(default)]
    pub id: Id,
}

impl Validate for AccessKeyPath {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new().required("id", !self.id.is_zero()).finish()
    }
}

/// `DELETE /api/access-keys?name=`, for the caller's own keys.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteAccessKeyRequest {
    #[serde(default)]
    pub name: String,
}

impl Validate for DeleteAccessKeyRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules.required("name", !self.name.is_empty());
        if !self.name.is_empty() {
            rules.name("name", &self.name);
        }
        rules.finish()
    }
}
