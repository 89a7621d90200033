use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use super::PageRequest;
use crate::models;
use crate::services::destinations::DestinationFields;
use crate::uid::Id;
use crate::utils::Rules;

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DestinationConnection {
    #[serde(default)]
    #[schema(example = "aa60eexample.us-west-2.elb.amazonaws.com")]
    pub url: String,
    /// PEM, stored as sent.
    #[serde(default)]
    pub ca: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    #[schema(value_type = String)]
    pub id: Id,
    #[serde(rename = "uniqueID")]
    pub unique_id: String,
    pub name: String,
    pub kind: String,
    #[serde(with = "super::time")]
    pub created: DateTime<Utc>,
    #[serde(with = "super::time")]
    pub updated: DateTime<Utc>,
    pub connection: DestinationConnection,
    pub resources: Vec<String>,
    pub roles: Vec<String>,
    #[serde(with = "super::time::option")]
    pub last_seen: Option<DateTime<Utc>>,
    pub connected: bool,
    pub version: String,
}

impl Destination {
    pub fn new(destination: models::Destination, now: DateTime<Utc>) -> Self {
        let connected = destination.is_connected(now);
        Self {
            id: destination.id,
            unique_id: destination.unique_id,
            name: destination.name,
            kind: destination.kind,
            created: destination.created_at,
            updated: destination.updated_at,
            connection: DestinationConnection {
                url: destination.connection_url,
                ca: destination.connection_ca,
            },
            resources: destination.resources,
            roles: destination.roles,
            last_seen: destination.last_seen_at,
            connected,
            version: destination.version,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDestinationsRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, rename = "uniqueID", alias = "unique_id")]
    pub unique_id: String,
    #[serde(flatten)]
    pub page: PageRequest,
}

impl Validate for ListDestinationsRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        self.page.check(&mut rules);
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRequest {
    /// Path parameter on update.
    #[serde(default)]
    #[schema(value_type = String)]
    pub id: Id,
    #[serde(default, rename = "uniqueID")]
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    #[schema(example = "kubernetes")]
    pub kind: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub connection: DestinationConnection,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl DestinationRequest {
    pub fn into_fields(self) -> DestinationFields {
        DestinationFields {
            name: self.name,
            unique_id: self.unique_id,
            kind: self.kind,
            connection_url: self.connection.url,
            connection_ca: self.connection.ca,
            resources: self.resources,
            roles: self.roles,
            version: self.version,
        }
    }
}

impl Validate for DestinationRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .required("uniqueID", !self.unique_id.is_empty())
            .required("name", !self.name.is_empty())
            .name("name", &self.name);
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationPath {
    #[serde(default)]
    pub id: Id,
}

impl Validate for DestinationPath {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new().required("id", !self.id.is_zero()).finish()
    }
}
