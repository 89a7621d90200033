use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use crate::models::DeviceFlowStatus;
use crate::services::device_flow::{ConfirmedLogin, PollResult, StartedFlow};
use crate::uid::Id;
use crate::utils::validation::{StringRule, USER_CODE_CHARS};
use crate::utils::Rules;

const USER_CODE: StringRule = StringRule {
    min_length: 8,
    max_length: 9,
    chars: USER_CODE_CHARS,
    first_chars: &[],
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDeviceFlowRequest {
    #[serde(default, rename = "clientID")]
    pub client_id: String,
}

impl Validate for StartDeviceFlowRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFlowResponse {
    pub device_code: String,
    #[serde(rename = "verificationURI")]
    #[schema(example = "https://acme.example.com/device")]
    pub verification_uri: String,
    #[schema(example = "BDSD-HQMK")]
    pub user_code: String,
    pub expires_in_seconds: i64,
    pub poll_interval_seconds: i64,
}

impl From<StartedFlow> for DeviceFlowResponse {
    fn from(flow: StartedFlow) -> Self {
        Self {
            device_code: flow.device_code,
            verification_uri: flow.verification_uri,
            user_code: flow.user_code,
            expires_in_seconds: flow.expires_in_seconds,
            poll_interval_seconds: flow.poll_interval_seconds,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PollDeviceFlowRequest {
    #[serde(default)]
    pub device_code: String,
    /// Checked against the client that started the pairing when present.
    #[serde(default, rename = "clientID")]
    pub client_id: String,
}

impl Validate for PollDeviceFlowRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules.required("deviceCode", !self.device_code.is_empty());
        if self.device_code.len() > 38 {
            rules.fail("deviceCode", "must be at most 38 characters");
        }
        rules.finish()
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLogin {
    #[serde(rename = "userID")]
    #[schema(value_type = String)]
    pub user_id: Id,
    pub name: String,
    pub access_key: String,
    pub organization_name: String,
    #[serde(with = "super::time")]
    pub expires: DateTime<Utc>,
    pub password_update_required: bool,
}

impl From<ConfirmedLogin> for DeviceLogin {
    fn from(login: ConfirmedLogin) -> Self {
        Self {
            user_id: login.user_id,
            name: login.name,
            access_key: login.access_key.unwrap_or_default(),
            organization_name: login.organization_name,
            expires: login.expires_at,
            password_update_required: false,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevicePollResponse {
    #[schema(value_type = String, example = "pending")]
    pub status: DeviceFlowStatus,
    pub device_code: String,
    #[serde(rename = "loginResponse", skip_serializing_if = "Option::is_none")]
    pub login: Option<DeviceLogin>,
}

impl From<PollResult> for DevicePollResponse {
    fn from(result: PollResult) -> Self {
        Self {
            status: result.status,
            device_code: result.device_code,
            login: result.login.map(DeviceLogin::from),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApproveDeviceFlowRequest {
    #[serde(default)]
    #[schema(example = "BDSD-HQMK")]
    pub user_code: String,
}

impl Validate for ApproveDeviceFlowRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .required("userCode", !self.user_code.is_empty())
            .string("userCode", &self.user_code.to_uppercase(), &USER_CODE);
        rules.finish()
    }
}
