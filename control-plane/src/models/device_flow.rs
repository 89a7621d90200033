use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::uid::Id;

/// A pending device-flow pairing.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DeviceFlowAuthRequest {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub client_id: String,
    /// Stored without the display dash.
    pub user_code: String,
    pub device_code: String,
    pub expires_at: DateTime<Utc>,
    /// Unset until someone approves or rejects.
    pub approved: Option<bool>,
    pub approved_by: Id,
    pub access_key_id: Option<Id>,
    /// Sealed bearer for the device; cleared once handed out.
    pub access_key_token: Option<String>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl DeviceFlowAuthRequest {
    pub fn new(
        client_id: impl Into<String>,
        user_code: String,
        device_code: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            client_id: client_id.into(),
            user_code,
            device_code,
            expires_at,
            approved: None,
            approved_by: Id::default(),
            access_key_id: None,
            access_key_token: None,
            last_polled_at: None,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> DeviceFlowStatus {
        match self.approved {
            Some(true) if self.access_key_id.is_some() => DeviceFlowStatus::Confirmed,
            Some(false) => DeviceFlowStatus::Rejected,
            _ if self.expires_at <= now => DeviceFlowStatus::Expired,
            _ => DeviceFlowStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFlowStatus {
    Pending,
    SlowDown,
    Expired,
    Rejected,
    Confirmed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(expires_in: i64) -> DeviceFlowAuthRequest {
        DeviceFlowAuthRequest::new(
            "cli",
            "BCDFGHJK".to_string(),
            "x".repeat(38),
            Utc::now() + Duration::seconds(expires_in),
        )
    }

    #[test]
    fn state_machine() {
        let now = Utc::now();
        let mut req = request(60);
        assert_eq!(req.status(now), DeviceFlowStatus::Pending);

        req.approved = Some(false);
        assert_eq!(req.status(now), DeviceFlowStatus::Rejected);

        req.approved = Some(true);
        req.access_key_id = Some(Id(9));
        assert_eq!(req.status(now), DeviceFlowStatus::Confirmed);
        // confirmed requests stay confirmed after expiry
        assert_eq!(req.status(now + Duration::hours(1)), DeviceFlowStatus::Confirmed);
    }

    #[test]
    fn expires() {
        let req = request(-1);
        assert_eq!(req.status(Utc::now()), DeviceFlowStatus::Expired);
    }
}
