use chrono::{DateTime, Utc};

use crate::uid::Id;

/// A tenant. Every other row carries the id of the organization that owns it.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Organization {
    pub id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    /// Hostname routed to this organization; globally unique.
    pub domain: String,
    pub created_by: Id,
    /// Email domains whose users may be provisioned automatically.
    pub allowed_domains: Vec<String>,
}

impl Organization {
    pub fn new(name: impl Into<String>, domain: impl Into<String>, created_by: Id) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            created_at: now,
            updated_at: now,
            name: name.into(),
            domain: domain.into(),
            created_by,
            allowed_domains: Vec::new(),
        }
    }
}
