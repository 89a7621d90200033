use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use crate::models::ProviderUser;
use crate::uid::Id;
use crate::utils::Rules;

pub const USER_SCHEMA: &str = "urn:ietf:params:scim:schemas:core:2.0:User";
pub const LIST_RESPONSE_SCHEMA: &str = "urn:ietf:params:scim:api:messages:2.0:ListResponse";

const DEFAULT_COUNT: u32 = 100;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScimName {
    pub given_name: String,
    pub family_name: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ScimEmail {
    pub primary: bool,
    pub value: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScimMeta {
    pub resource_type: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScimUser {
    pub schemas: Vec<String>,
    #[schema(value_type = String)]
    pub id: Id,
    pub user_name: String,
    pub name: ScimName,
    pub emails: Vec<ScimEmail>,
    pub active: bool,
    pub meta: ScimMeta,
}

impl From<ProviderUser> for ScimUser {
    fn from(user: ProviderUser) -> Self {
        Self {
            schemas: vec![USER_SCHEMA.to_string()],
            id: user.identity_id,
            user_name: user.email.clone(),
            name: ScimName {
                given_name: user.given_name,
                family_name: user.family_name,
            },
            emails: vec![ScimEmail {
                primary: true,
                value: user.email,
            }],
            active: user.active,
            meta: ScimMeta {
                resource_type: "User".to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScimListResponse {
    pub schemas: Vec<String>,
    pub total_results: i64,
    pub start_index: u32,
    pub items_per_page: u32,
    #[serde(rename = "Resources")]
    pub resources: Vec<ScimUser>,
}

/// SCIM paging: `startIndex` is one-based and counts items, not pages.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScimListRequest {
    #[serde(default, deserialize_with = "crate::api::binding::number")]
    pub start_index: u32,
    #[serde(default, deserialize_with = "crate::api::binding::number")]
    pub count: u32,
}

impl ScimListRequest {
    pub fn start_index(&self) -> u32 {
        self.start_index.max(1)
    }

    pub fn count(&self) -> u32 {
        if self.count == 0 {
            DEFAULT_COUNT
        } else {
            self.count
        }
    }
}

impl Validate for ScimListRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        if self.count != 0 {
            rules.range("count", i64::from(self.count), 1, i64::from(super::MAX_PAGE_LIMIT));
        }
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScimUserPath {
    #[serde(default)]
    pub id: Id,
}

impl Validate for ScimUserPath {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new().required("id", !self.id.is_zero()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scim_user_shape() {
        let mut user = ProviderUser::new(Id(58), Id(59), "jane@example.com");
        user.given_name = "Jane".to_string();
        user.active = true;
        let json = serde_json::to_value(ScimUser::from(user)).unwrap();
        assert_eq!(json["schemas"][0], USER_SCHEMA);
        assert_eq!(json["userName"], "jane@example.com");
        assert_eq!(json["name"]["givenName"], "Jane");
        assert_eq!(json["emails"][0]["primary"], true);
        assert_eq!(json["meta"]["resourceType"], "User");
    }

    #[test]
    fn paging_defaults() {
        let req = ScimListRequest::default();
        assert_eq!((req.start_index(), req.count()), (1, 100));
    }
}
