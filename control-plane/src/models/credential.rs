use chrono::{DateTime, Utc};

use crate::uid::Id;

/// Password hash for an identity under the `infra` provider.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Credential {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub identity_id: Id,
    pub password_hash: String,
    /// The password was issued by someone else and must be changed on next use.
    pub one_time_password: bool,
}

impl Credential {
    pub fn new(identity_id: Id, password_hash: String, one_time_password: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            identity_id,
            password_hash,
            one_time_password,
        }
    }
}
