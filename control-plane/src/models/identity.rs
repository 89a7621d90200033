use chrono::{DateTime, Utc};

use crate::uid::Id;

/// Name of the per-organization identity used by destination connectors.
pub const CONNECTOR_IDENTITY_NAME: &str = "connector";

/// A principal (user) inside one organization.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Identity {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Email-shaped, unique within the organization.
    pub name: String,
    pub verified: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_by: Id,
}

impl Identity {
    pub fn new(name: impl Into<String>, created_by: Id) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            name: name.into(),
            verified: false,
            last_seen_at: None,
            created_by,
        }
    }

    pub fn is_connector(&self) -> bool {
        self.name == CONNECTOR_IDENTITY_NAME
    }
}
