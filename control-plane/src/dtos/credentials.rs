use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use crate::models;
use crate::uid::Id;
use crate::utils::Rules;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationCredential {
    #[schema(value_type = String)]
    pub id: Id,
    #[serde(with = "super::time")]
    pub request_expires_at: DateTime<Utc>,
    #[serde(rename = "userID")]
    #[schema(value_type = String)]
    pub user_id: Id,
    #[serde(rename = "destinationID")]
    #[schema(value_type = String)]
    pub destination_id: Id,
    pub update_index: i64,
    pub answered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", with = "super::time::option")]
    pub credential_expires_at: Option<DateTime<Utc>>,
}

impl From<models::DestinationCredential> for DestinationCredential {
    fn from(cred: models::DestinationCredential) -> Self {
        Self {
            id: cred.id,
            request_expires_at: cred.request_expires_at,
            user_id: cred.requester_user_id,
            destination_id: cred.destination_id,
            update_index: cred.update_index,
            answered: cred.answered,
            bearer_token: cred.bearer_token,
            credential_expires_at: cred.credential_expires_at,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CreateDestinationCredentialRequest {
    /// Destination name.
    #[serde(default)]
    #[schema(example = "production")]
    pub destination: String,
}

impl Validate for CreateDestinationCredentialRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new()
            .required("destination", !self.destination.is_empty())
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDestinationCredentialRequest {
    /// Destination unique id, as the connector knows it.
    #[serde(default)]
    pub destination: String,
    #[serde(default, deserialize_with = "crate::api::binding::number")]
    pub last_update_index: i64,
}

impl Validate for ListDestinationCredentialRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules.required("destination", !self.destination.is_empty());
        if self.last_update_index < 0 {
            rules.fail("lastUpdateIndex", "must not be negative");
        }
        rules.finish()
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListDestinationCredentialResponse {
    pub items: Vec<DestinationCredential>,
    pub max_update_index: i64,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnswerDestinationCredentialRequest {
    #[serde(default)]
    #[schema(value_type = String)]
    pub id: Id,
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default, with = "super::time::option")]
    pub credential_expires_at: Option<DateTime<Utc>>,
}

impl Validate for AnswerDestinationCredentialRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .required("id", !self.id.is_zero())
            .required("bearerToken", !self.bearer_token.is_empty())
            .required("credentialExpiresAt", self.credential_expires_at.is_some());
        rules.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::binding::bind;
    use serde_json::json;

    #[test]
    fn answer_needs_token_and_expiry() {
        assert!(bind::<AnswerDestinationCredentialRequest>(json!({"id": "21", "bearerToken": "t"})).is_err());
        let ok: AnswerDestinationCredentialRequest = bind(json!({
            "id": "21",
            "bearerToken": "t",
            "credentialExpiresAt": "2030-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(ok.credential_expires_at.is_some());
    }

    #[test]
    fn last_update_index_reads_from_the_query() {
        let req: ListDestinationCredentialRequest =
            bind(json!({"destination": "cluster-1", "lastUpdateIndex": "7"})).unwrap();
        assert_eq!(req.last_update_index, 7);
    }
}
