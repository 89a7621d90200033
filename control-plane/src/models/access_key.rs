use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::uid::Id;

/// Restricts a key to `PUT /api/users/{issued_for}` until the password changes.
pub const SCOPE_PASSWORD_RESET: &str = "password_reset";
/// The key may be exchanged for, or used to create, other keys.
pub const SCOPE_ALLOW_CREATE_ACCESS_KEY: &str = "allow_create_access_key";
/// The key may approve device-flow requests.
pub const SCOPE_ALLOW_APPROVE_DEVICE_FLOW: &str = "allow_approve_device_flow_request";

pub const KEY_ID_LENGTH: usize = 10;
pub const SECRET_LENGTH: usize = 24;

/// A bearer credential of the form `<key_id>.<secret>`. Only the bcrypt hash
/// of the secret is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessKey {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    /// Also the time of the last inactivity extension.
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub issued_for: Id,
    /// Filled on reads from the owning identity.
    pub issued_for_name: String,
    pub provider_id: Id,
    pub expires_at: DateTime<Utc>,
    pub inactivity_extension: Duration,
    pub inactivity_timeout_at: DateTime<Utc>,
    pub key_id: String,
    pub secret_hash: String,
    pub scopes: Vec<String>,
}

impl AccessKey {
    pub fn new(issued_for: Id, provider_id: Id) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            name: String::new(),
            issued_for,
            issued_for_name: String::new(),
            provider_id,
            expires_at: now,
            inactivity_extension: Duration::ZERO,
            inactivity_timeout_at: now,
            key_id: String::new(),
            secret_hash: String::new(),
            scopes: Vec::new(),
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now || self.inactivity_timeout_at <= now
    }

    /// The bearer string presented by clients.
    pub fn token(&self, secret: &str) -> String {
        format!("{}.{}", self.key_id, secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn expiry_checks_both_deadlines() {
        let now = Utc::now();
        let mut key = AccessKey::new(Id(1), Id(2));
        key.expires_at = now + ChronoDuration::hours(1);
        key.inactivity_timeout_at = now + ChronoDuration::minutes(5);
        assert!(!key.is_expired(now));

        key.inactivity_timeout_at = now;
        assert!(key.is_expired(now));

        key.inactivity_timeout_at = now + ChronoDuration::minutes(5);
        key.expires_at = now - ChronoDuration::seconds(1);
        assert!(key.is_expired(now));
    }

    #[test]
    fn scopes() {
        let mut key = AccessKey::new(Id(1), Id(2));
        key.scopes = vec![SCOPE_PASSWORD_RESET.to_string()];
        assert!(key.has_scope(SCOPE_PASSWORD_RESET));
        assert!(!key.has_scope(SCOPE_ALLOW_CREATE_ACCESS_KEY));
    }
}
