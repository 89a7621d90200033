use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::uid::Id;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_VIEW: &str = "view";
pub const ROLE_CONNECTOR: &str = "connector";
pub const ROLE_SUPPORT_ADMIN: &str = "support-admin";

/// Resource naming the control plane itself.
pub const RESOURCE_INFRA: &str = "infra";

/// Who a grant applies to. The `user:<id>` / `group:<id>` string form only
/// exists at the encode/decode boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    User(Id),
    Group(Id),
}

impl Subject {
    pub fn kind(&self) -> &'static str {
        match self {
            Subject::User(_) => "user",
            Subject::Group(_) => "group",
        }
    }

    pub fn id(&self) -> Id {
        match self {
            Subject::User(id) | Subject::Group(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: Id) -> Result<Self, String> {
        match kind {
            "user" => Ok(Subject::User(id)),
            "group" => Ok(Subject::Group(id)),
            other => Err(format!("unknown subject kind: {}", other)),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

impl FromStr for Subject {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid subject: {}", s))?;
        let id = Id::parse(id).map_err(|e| e.to_string())?;
        Subject::from_parts(kind, id)
    }
}

/// Grants `privilege` on `resource` to `subject`. Unique per triple.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub id: Id,
    pub organization_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Id,
    pub subject: Subject,
    pub privilege: String,
    pub resource: String,
}

impl Grant {
    pub fn new(subject: Subject, privilege: impl Into<String>, resource: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Id::default(),
            organization_id: Id::default(),
            created_at: now,
            updated_at: now,
            created_by: Id::default(),
            subject,
            privilege: privilege.into(),
            resource: resource.into(),
        }
    }

    /// True when the grant covers `destination` or one of its sub-resources.
    pub fn applies_to_destination(&self, destination: &str) -> bool {
        self.resource == destination
            || self
                .resource
                .strip_prefix(destination)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_string_form() {
        let subject = Subject::Group(Id(58));
        assert_eq!(subject.to_string(), "group:21");
        assert_eq!("group:21".parse::<Subject>().unwrap(), subject);
        assert!("team:21".parse::<Subject>().is_err());
        assert!("user".parse::<Subject>().is_err());
    }

    #[test]
    fn destination_matching() {
        let grant = Grant::new(Subject::User(Id(1)), ROLE_VIEW, "prod.default");
        assert!(grant.applies_to_destination("prod"));
        assert!(!grant.applies_to_destination("pro"));
        assert!(!grant.applies_to_destination("staging"));
    }
}
