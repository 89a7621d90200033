use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use super::PageRequest;
use crate::models::{self, Subject};
use crate::uid::Id;
use crate::utils::validation::{StringRule, DASH, DIGITS, LOWER, UNDERSCORE, UPPER};
use crate::utils::Rules;

/// Destination names may not contain dots.
const DESTINATION_NAME: StringRule = StringRule {
    min_length: 2,
    max_length: 256,
    chars: &[LOWER, UPPER, DIGITS, DASH, UNDERSCORE],
    first_chars: &[],
};

fn zero_is_none(id: &Id) -> bool {
    id.is_zero()
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    #[schema(value_type = String)]
    pub id: Id,
    #[serde(with = "super::time")]
    pub created: DateTime<Utc>,
    #[schema(value_type = String)]
    pub created_by: Id,
    #[serde(with = "super::time")]
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "zero_is_none")]
    #[schema(value_type = String)]
    pub user: Id,
    #[serde(skip_serializing_if = "zero_is_none")]
    #[schema(value_type = String)]
    pub group: Id,
    #[schema(example = "admin")]
    pub privilege: String,
    #[schema(example = "production.namespace")]
    pub resource: String,
}

impl From<models::Grant> for Grant {
    fn from(grant: models::Grant) -> Self {
        let (user, group) = match grant.subject {
            Subject::User(id) => (id, Id(0)),
            Subject::Group(id) => (Id(0), id),
        };
        Self {
            id: grant.id,
            created: grant.created_at,
            created_by: grant.created_by,
            updated: grant.updated_at,
            user,
            group,
            privilege: grant.privilege,
            resource: grant.resource,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateGrantResponse {
    #[serde(flatten)]
    pub grant: Grant,
    /// False when the grant already existed.
    pub was_created: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListGrantsRequest {
    #[serde(default)]
    pub user: Id,
    #[serde(default)]
    pub group: Id,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub privilege: String,
    #[serde(default, deserialize_with = "crate::api::binding::boolean")]
    pub show_inherited: bool,
    #[serde(default, deserialize_with = "crate::api::binding::boolean")]
    pub show_system: bool,
    #[serde(flatten)]
    pub page: PageRequest,
}

impl Validate for ListGrantsRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .mutually_exclusive(&[("user", !self.user.is_zero()), ("group", !self.group.is_zero())])
            .mutually_exclusive(&[
                ("resource", !self.resource.is_empty()),
                ("destination", !self.destination.is_empty()),
            ]);
        if !self.destination.is_empty() {
            rules.string("destination", &self.destination, &DESTINATION_NAME);
        }
        if self.show_inherited && self.user.is_zero() {
            rules.fail("showInherited", "requires a user ID");
        }
        self.page.check(&mut rules);
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateGrantRequest {
    #[serde(default)]
    #[schema(value_type = String)]
    pub user: Id,
    #[serde(default)]
    #[schema(value_type = String)]
    pub group: Id,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    #[schema(example = "view")]
    pub privilege: String,
    #[serde(default)]
    #[schema(example = "production")]
    pub resource: String,
}

impl Validate for CreateGrantRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .require_one_of(&[
                ("user", !self.user.is_zero()),
                ("userName", !self.user_name.is_empty()),
                ("group", !self.group.is_zero()),
                ("groupName", !self.group_name.is_empty()),
            ])
            .required("privilege", !self.privilege.trim().is_empty())
            .required("resource", !self.resource.trim().is_empty());
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GrantPath {
    #[serde(default)]
    pub id: Id,
}

impl Validate for GrantPath {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new().required("id", !self.id.is_zero()).finish()
    }
}
