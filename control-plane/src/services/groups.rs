use service_core::error::AppError;

use crate::data::{ListGroupsOptions, Paged, Transaction};
use crate::models::{Group, Subject};
use crate::uid::Id;

pub async fn list(tx: &mut dyn Transaction, opts: &ListGroupsOptions) -> Result<Paged<Group>, AppError> {
    Ok(tx.list_groups(opts).await?)
}

pub async fn get(tx: &mut dyn Transaction, id: Id) -> Result<Group, AppError> {
    Ok(tx.get_group(id).await?)
}

pub async fn create(tx: &mut dyn Transaction, name: &str, created_by: Id) -> Result<Group, AppError> {
    let mut group = Group::new(name, created_by);
    tx.create_group(&mut group).await?;
    tracing::info!(group_id = %group.id, "Created group");
    Ok(group)
}

pub async fn delete(tx: &mut dyn Transaction, id: Id) -> Result<(), AppError> {
    tx.get_group(id).await?;
    tx.delete_grants_for_subject(Subject::Group(id)).await?;
    tx.delete_group(id).await?;
    Ok(())
}

/// Adds then removes members. Removing a user that is not a member is a no-op.
pub async fn update_users(
    tx: &mut dyn Transaction,
    group_id: Id,
    add: &[Id],
    remove: &[Id],
) -> Result<(), AppError> {
    if !add.is_empty() {
        tx.add_users_to_group(group_id, add).await?;
    }
    if !remove.is_empty() {
        tx.remove_users_from_group(group_id, remove).await?;
    }
    Ok(())
}

pub async fn member_count(tx: &mut dyn Transaction, group_id: Id) -> Result<i64, AppError> {
    Ok(tx.count_group_members(group_id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryStore, Store, TxOptions};
    use crate::models::{Grant, Identity, Organization};

    #[tokio::test]
    async fn membership_and_delete() {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new("acme", "acme.example.com", Id(0));
        tx.create_organization(&mut org).await.unwrap();
        tx.set_organization_id(Some(org.id));
        let mut user = Identity::new("a@example.com", Id(0));
        tx.create_identity(&mut user).await.unwrap();

        let group = create(tx.as_mut(), "devs", user.id).await.unwrap();
        update_users(tx.as_mut(), group.id, &[user.id], &[]).await.unwrap();
        assert_eq!(member_count(tx.as_mut(), group.id).await.unwrap(), 1);
        assert_eq!(tx.list_group_ids_for_user(user.id).await.unwrap(), vec![group.id]);

        let mut grant = Grant::new(Subject::Group(group.id), "view", "infra");
        tx.create_grant(&mut grant).await.unwrap();

        update_users(tx.as_mut(), group.id, &[], &[user.id]).await.unwrap();
        assert_eq!(member_count(tx.as_mut(), group.id).await.unwrap(), 0);

        delete(tx.as_mut(), group.id).await.unwrap();
        assert!(tx.get_grant(grant.id).await.is_err());
        assert!(matches!(get(tx.as_mut(), group.id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn adding_unknown_users_fails() {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new("acme", "acme.example.com", Id(0));
        tx.create_organization(&mut org).await.unwrap();
        tx.set_organization_id(Some(org.id));

        let group = create(tx.as_mut(), "devs", Id(0)).await.unwrap();
        let err = update_users(tx.as_mut(), group.id, &[Id(12345)], &[]).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
