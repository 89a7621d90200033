use chrono::{DateTime, Duration, Utc};

use crate::uid::Id;

/// A destination counts as connected when its connector checked in this recently.
const CONNECTED_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Destination {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    /// Chosen by the connector; stable across re-registration.
    pub unique_id: String,
    pub kind: String,
    pub connection_url: String,
    /// PEM, stored byte-for-byte.
    pub connection_ca: String,
    pub resources: Vec<String>,
    pub roles: Vec<String>,
    pub version: String,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Destination {
    pub fn new(name: impl Into<String>, unique_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            name: name.into(),
            unique_id: unique_id.into(),
            kind: "kubernetes".to_string(),
            connection_url: String::new(),
            connection_ca: String::new(),
            resources: Vec::new(),
            roles: Vec::new(),
            version: String::new(),
            last_seen_at: None,
        }
    }

    pub fn is_connected(&self, now: DateTime<Utc>) -> bool {
        self.last_seen_at
            .is_some_and(|seen| now - seen < Duration::minutes(CONNECTED_WINDOW_MINUTES))
    }
}
