use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use super::PageRequest;
use crate::models::Identity;
use crate::uid::{Id, IdOrSelf};
use crate::utils::Rules;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[schema(value_type = String)]
    pub id: Id,
    #[schema(example = "bob@example.com")]
    pub name: String,
    #[serde(with = "super::time")]
    pub created: DateTime<Utc>,
    #[serde(with = "super::time")]
    pub updated: DateTime<Utc>,
    #[serde(with = "super::time::option")]
    pub last_seen_at: Option<DateTime<Utc>>,
    pub verified: bool,
}

impl From<Identity> for User {
    fn from(identity: Identity) -> Self {
        Self {
            id: identity.id,
            name: identity.name,
            created: identity.created_at,
            updated: identity.updated_at,
            last_seen_at: identity.last_seen_at,
            verified: identity.verified,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUsersRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: Id,
    #[serde(default, deserialize_with = "crate::api::binding::strings")]
    pub ids: Vec<String>,
    #[serde(default, deserialize_with = "crate::api::binding::boolean")]
    pub show_system: bool,
    #[serde(flatten)]
    pub page: PageRequest,
}

impl ListUsersRequest {
    pub fn parsed_ids(&self) -> Vec<Id> {
        self.ids.iter().filter_map(|s| Id::parse(s).ok()).collect()
    }
}

impl Validate for ListUsersRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        if self.ids.iter().any(|s| Id::parse(s).is_err()) {
            rules.fail("ids", "must be a list of ids");
        }
        self.page.check(&mut rules);
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetUserRequest {
    #[serde(default)]
    pub id: IdOrSelf,
}

impl Validate for GetUserRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new()
            .required("id", self.id != IdOrSelf::Id(Id(0)))
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CreateUserRequest {
    #[serde(default)]
    #[schema(example = "bob@example.com")]
    pub name: String,
}

impl Validate for CreateUserRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .required("name", !self.name.is_empty())
            .email("name", &self.name);
        rules.finish()
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserResponse {
    #[schema(value_type = String)]
    pub id: Id,
    pub name: String,
    /// Only when no invite email went out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_password: Option<String>,
}

/// `PUT /api/users/{id|self}`: a password change for the caller, or an
/// admin reset for someone else.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    #[serde(default)]
    #[schema(value_type = String)]
    pub id: IdOrSelf,
    #[serde(default)]
    pub old_password: String,
    #[serde(default)]
    pub password: String,
}

impl Validate for UpdateUserRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new()
            .required("id", self.id != IdOrSelf::Id(Id(0)))
            .finish()
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserResponse {
    #[serde(flatten)]
    pub user: User,
    /// Set when an admin reset the password without choosing one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPath {
    #[serde(default)]
    pub id: Id,
}

impl Validate for UserPath {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new().required("id", !self.id.is_zero()).finish()
    }
}
