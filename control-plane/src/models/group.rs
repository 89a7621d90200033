use chrono::{DateTime, Utc};

use crate::uid::Id;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Group {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub created_by: Id,
    /// Set when the group was synchronised from an identity provider.
    pub created_by_provider: Id,
}

impl Group {
    pub fn new(name: impl Into<String>, created_by: Id) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            name: name.into(),
            created_by,
            created_by_provider: Id::default(),
        }
    }
}
