use chrono::{DateTime, Duration, Utc};

use crate::uid::Id;
use crate::utils::generate;

const TOKEN_LENGTH: usize = 10;

/// Single-use secret that lets an identity set a new password.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PasswordResetToken {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub token: String,
    pub identity_id: Id,
    pub expires_at: DateTime<Utc>,
}

impl PasswordResetToken {
    pub fn new(identity_id: Id, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            token: generate::alphanumeric(TOKEN_LENGTH),
            identity_id,
            expires_at: now + ttl,
        }
    }
}

/// Single-use secret mailed to a new identity to prove ownership of the address.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct EmailVerificationToken {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub token: String,
    pub identity_id: Id,
    pub expires_at: DateTime<Utc>,
}

impl EmailVerificationToken {
    pub fn new(identity_id: Id, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            token: generate::alphanumeric(TOKEN_LENGTH),
            identity_id,
            expires_at: now + ttl,
        }
    }
}
