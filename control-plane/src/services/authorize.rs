//! Role checks against the caller's grants.

use service_core::error::AppError;

use crate::data::{ListGrantsOptions, Transaction};
use crate::models::grant::RESOURCE_INFRA;
use crate::models::Subject;
use crate::uid::Id;

/// The permission a route needs, for error messages and the role check.
#[derive(Debug, Clone, Copy)]
pub struct Requirement {
    pub resource: &'static str,
    pub operation: &'static str,
    pub roles: &'static [&'static str],
}

impl Requirement {
    pub const fn new(
        resource: &'static str,
        operation: &'static str,
        roles: &'static [&'static str],
    ) -> Self {
        Self {
            resource,
            operation,
            roles,
        }
    }

    pub fn denied(&self) -> AppError {
        AppError::Forbidden(format!(
            "you do not have permission to {} {}, requires role {}",
            self.operation,
            self.resource,
            join_roles(self.roles)
        ))
    }
}

fn join_roles(roles: &[&str]) -> String {
    match roles {
        [] => String::new(),
        [one] => one.to_string(),
        [rest @ .., last] => format!("{}, or {}", rest.join(", "), last),
    }
}

/// The user itself plus every group it belongs to.
pub async fn subjects_for(tx: &mut dyn Transaction, user_id: Id) -> Result<Vec<Subject>, AppError> {
    let mut subjects = vec![Subject::User(user_id)];
    for group_id in tx.list_group_ids_for_user(user_id).await? {
        subjects.push(Subject::Group(group_id));
    }
    Ok(subjects)
}

/// True when the user, directly or through a group, holds one of `roles` on
/// `resource` or on `infra`.
pub async fn has_role(
    tx: &mut dyn Transaction,
    user_id: Id,
    resource: &str,
    roles: &[&str],
) -> Result<bool, AppError> {
    let subjects = subjects_for(tx, user_id).await?;
    let grants = tx
        .list_grants(&ListGrantsOptions {
            subjects,
            ..Default::default()
        })
        .await?;
    Ok(grants.items.iter().any(|g| {
        roles.contains(&g.privilege.as_str())
            && (g.resource == resource || g.resource == RESOURCE_INFRA)
    }))
}

pub async fn require_infra_role(
    tx: &mut dyn Transaction,
    user_id: Id,
    requirement: &Requirement,
) -> Result<(), AppError> {
    if has_role(tx, user_id, RESOURCE_INFRA, requirement.roles).await? {
        return Ok(());
    }
    tracing::debug!(
        user_id = %user_id,
        resource = requirement.resource,
        operation = requirement.operation,
        "Authorization denied"
    );
    Err(requirement.denied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryStore, Store, TxOptions};
    use crate::models::grant::{ROLE_ADMIN, ROLE_VIEW};
    use crate::models::{Grant, Group, Identity, Organization};

    const READ_USERS: Requirement = Requirement::new("users", "read", &[ROLE_ADMIN, ROLE_VIEW]);

    async fn setup() -> (Box<dyn Transaction>, Identity) {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new("acme", "acme.example.com", Id(0));
        tx.create_organization(&mut org).await.unwrap();
        tx.set_organization_id(Some(org.id));
        let mut user = Identity::new("hubert@example.com", Id(0));
        tx.create_identity(&mut user).await.unwrap();
        (tx, user)
    }

    #[tokio::test]
    async fn direct_grant_allows() {
        let (mut tx, user) = setup().await;
        assert!(require_infra_role(tx.as_mut(), user.id, &READ_USERS).await.is_err());

        let mut grant = Grant::new(Subject::User(user.id), ROLE_VIEW, RESOURCE_INFRA);
        tx.create_grant(&mut grant).await.unwrap();
        assert!(require_infra_role(tx.as_mut(), user.id, &READ_USERS).await.is_ok());
    }

    #[tokio::test]
    async fn group_grant_allows() {
        let (mut tx, user) = setup().await;
        let mut group = Group::new("admins", Id(0));
        tx.create_group(&mut group).await.unwrap();
        tx.add_users_to_group(group.id, &[user.id]).await.unwrap();
        let mut grant = Grant::new(Subject::Group(group.id), ROLE_ADMIN, RESOURCE_INFRA);
        tx.create_grant(&mut grant).await.unwrap();

        assert!(require_infra_role(tx.as_mut(), user.id, &READ_USERS).await.is_ok());
    }

    #[tokio::test]
    async fn other_resources_do_not_count() {
        let (mut tx, user) = setup().await;
        let mut grant = Grant::new(Subject::User(user.id), ROLE_ADMIN, "prod-cluster");
        tx.create_grant(&mut grant).await.unwrap();

        let err = require_infra_role(tx.as_mut(), user.id, &READ_USERS)
            .await
            .unwrap_err();
        match err {
            AppError::Forbidden(message) => assert_eq!(
                message,
                "you do not have permission to read users, requires role admin, or view"
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn role_lists_read_naturally() {
        assert_eq!(join_roles(&["admin"]), "admin");
        assert_eq!(join_roles(&["admin", "view", "connector"]), "admin, view, or connector");
    }
}
