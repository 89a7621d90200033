use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use crate::models;
use crate::uid::{Id, IdOrSelf};
use crate::utils::Rules;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    #[schema(value_type = String)]
    pub id: Id,
    pub name: String,
    #[serde(with = "super::time")]
    pub created: DateTime<Utc>,
    #[serde(with = "super::time")]
    pub updated: DateTime<Utc>,
    #[schema(example = "acme.example.com")]
    pub domain: String,
    pub allowed_domains: Vec<String>,
}

impl From<models::Organization> for Organization {
    fn from(org: models::Organization) -> Self {
        Self {
            id: org.id,
            name: org.name,
            created: org.created_at,
            updated: org.updated_at,
            domain: org.domain,
            allowed_domains: org.allowed_domains,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrganizationPath {
    #[serde(default)]
    pub id: IdOrSelf,
}

impl Validate for OrganizationPath {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new()
            .required("id", self.id != IdOrSelf::Id(Id(0)))
            .finish()
    }
}
