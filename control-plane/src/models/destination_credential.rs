use chrono::{DateTime, Utc};

use crate::uid::Id;

/// A user's request for a destination-issued credential, answered by the
/// destination's connector.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DestinationCredential {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub destination_id: Id,
    pub requester_user_id: Id,
    /// Assigned by the store from a monotonic sequence.
    pub update_index: i64,
    pub request_expires_at: DateTime<Utc>,
    pub answered: bool,
    pub bearer_token: Option<String>,
    pub credential_expires_at: Option<DateTime<Utc>>,
}

impl DestinationCredential {
    pub fn new(destination_id: Id, requester_user_id: Id, request_expires_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            destination_id,
            requester_user_id,
            update_index: 0,
            request_expires_at,
            answered: false,
            bearer_token: None,
            credential_expires_at: None,
        }
    }

    pub fn is_pending(&self, now: DateTime<Utc>) -> bool {
        !self.answered && self.request_expires_at > now
    }
}
