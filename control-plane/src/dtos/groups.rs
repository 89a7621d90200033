use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use super::PageRequest;
use crate::models;
use crate::uid::Id;
use crate::utils::Rules;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    #[schema(value_type = String)]
    pub id: Id,
    #[schema(example = "developers")]
    pub name: String,
    #[serde(with = "super::time")]
    pub created: DateTime<Utc>,
    #[serde(with = "super::time")]
    pub updated: DateTime<Utc>,
    pub total_users: i64,
}

impl Group {
    pub fn new(group: models::Group, total_users: i64) -> Self {
        Self {
            id: group.id,
            name: group.name,
            created: group.created_at,
            updated: group.updated_at,
            total_users,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListGroupsRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "userID")]
    pub user_id: Id,
    #[serde(flatten)]
    pub page: PageRequest,
}

impl Validate for ListGroupsRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        self.page.check(&mut rules);
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CreateGroupRequest {
    #[serde(default)]
    pub name: String,
}

impl Validate for CreateGroupRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .required("name", !self.name.is_empty())
            .name("name", &self.name);
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupPath {
    #[serde(default)]
    pub id: Id,
}

impl Validate for GroupPath {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new().required("id", !self.id.is_zero()).finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUsersInGroupRequest {
    #[serde(default)]
    #[schema(value_type = String)]
    pub id: Id,
    #[serde(default, rename = "usersToAdd")]
    #[schema(value_type = Vec<String>)]
    pub users_to_add: Vec<Id>,
    #[serde(default, rename = "usersToRemove")]
    #[schema(value_type = Vec<String>)]
    pub users_to_remove: Vec<Id>,
}

impl Validate for UpdateUsersInGroupRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules.required("id", !self.id.is_zero()).require_any_of(&[
            ("usersToAdd", !self.users_to_add.is_empty()),
            ("usersToRemove", !self.users_to_remove.is_empty()),
        ]);
        rules.finish()
    }
}
