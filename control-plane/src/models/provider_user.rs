use chrono::{DateTime, Utc};

use crate::uid::Id;

/// Links an identity to a provider, with the provider-side tokens (sealed).
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProviderUser {
    pub identity_id: Id,
    pub provider_id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub email: String,
    pub given_name: String,
    pub family_name: String,
    pub groups: Vec<String>,
    pub last_update: DateTime<Utc>,
    pub redirect_url: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl ProviderUser {
    pub fn new(identity_id: Id, provider_id: Id, email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            identity_id,
            provider_id,
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            email: email.into(),
            given_name: String::new(),
            family_name: String::new(),
            groups: Vec::new(),
            last_update: now,
            redirect_url: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            expires_at: now,
            active: true,
        }
    }
}
