//! Destination credential requests: a user asks, the destination's connector
//! answers, and both sides wait on broker notifications instead of
//! holding a transaction open.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::data::{ListGrantsOptions, Store, Transaction, TxOptions};
use crate::models::{Destination, DestinationCredential};
use crate::services::authorize;
use crate::uid::Id;

/// How long a connector has to answer a request.
pub const REQUEST_TTL: ChronoDuration = ChronoDuration::minutes(2);

#[derive(Debug, Clone, Default)]
pub struct PendingList {
    pub items: Vec<DestinationCredential>,
    pub max_update_index: i64,
}

/// A read-only transaction scoped to `org_id`, for reads after the request
/// transaction has committed.
async fn read_tx(store: &Arc<dyn Store>, org_id: Id) -> Result<Box<dyn Transaction>, AppError> {
    let mut tx = store.begin(TxOptions::read_only()).await?;
    tx.set_organization_id(Some(org_id));
    Ok(tx)
}

async fn pending(tx: &mut dyn Transaction, destination_id: Id, after: i64) -> Result<PendingList, AppError> {
    let items = tx
        .list_destination_credentials(destination_id, after, Utc::now())
        .await?;
    let max_update_index = tx
        .max_destination_credential_update_index(destination_id)
        .await?
        .unwrap_or_default();
    Ok(PendingList {
        items,
        max_update_index,
    })
}

/// Records a request from `user_id` for `destination_name`. The user needs
/// a grant on the destination, directly or through a group.
pub async fn create(
    tx: &mut dyn Transaction,
    user_id: Id,
    destination_name: &str,
) -> Result<DestinationCredential, AppError> {
    let subjects = authorize::subjects_for(tx, user_id).await?;
    let grants = tx
        .list_grants(&ListGrantsOptions {
            subjects,
            destination: Some(destination_name.to_string()),
            ..Default::default()
        })
        .await?;
    if grants.items.is_empty() {
        return Err(AppError::unauthorized(format!(
            "no grant on destination {}",
            destination_name
        )));
    }

    let destination = tx.get_destination_by_name(destination_name).await?;
    let mut request = DestinationCredential::new(destination.id, user_id, Utc::now() + REQUEST_TTL);
    tx.create_destination_credential(&mut request).await?;
    tracing::debug!(request_id = %request.id, destination_id = %destination.id, "Created credential request");
    Ok(request)
}

/// Re-reads the request whenever the destination's queue changes until it is
/// answered. Running out of time is a `504`.
pub async fn wait_for_answer(
    store: &Arc<dyn Store>,
    mut changes: watch::Receiver<u64>,
    request: &DestinationCredential,
    deadline: Instant,
) -> Result<DestinationCredential, AppError> {
    loop {
        let current = {
            let mut tx = read_tx(store, request.organization_id).await?;
            let current = tx.get_destination_credential(request.id).await?;
            tx.rollback().await?;
            current
        };
        if current.answered {
            return Ok(current);
        }
        match tokio::time::timeout_at(deadline, changes.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) | Err(_) => {
                tracing::debug!(request_id = %request.id, "Credential request was not answered in time");
                return Err(AppError::GatewayTimeout);
            }
        }
    }
}

/// The first page of a connector's long poll, read inside the request
/// transaction. Returns `Some` when the caller can answer immediately.
pub async fn list_immediate(
    tx: &mut dyn Transaction,
    destination: &Destination,
    last_update_index: i64,
) -> Result<Option<PendingList>, AppError> {
    if last_update_index != 0 {
        return Ok(None);
    }
    let listed = pending(tx, destination.id, 0).await?;
    Ok((!listed.items.is_empty()).then_some(listed))
}

/// Waits for requests newer than `last_update_index`. A timeout is not an
/// error: the connector gets an empty list and polls again.
pub async fn wait_for_pending(
    store: &Arc<dyn Store>,
    mut changes: watch::Receiver<u64>,
    org_id: Id,
    destination_id: Id,
    last_update_index: i64,
    deadline: Instant,
) -> Result<PendingList, AppError> {
    loop {
        let listed = {
            let mut tx = read_tx(store, org_id).await?;
            let listed = pending(tx.as_mut(), destination_id, last_update_index).await?;
            tx.rollback().await?;
            listed
        };
        if !listed.items.is_empty() {
            return Ok(listed);
        }
        match tokio::time::timeout_at(deadline, changes.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) | Err(_) => return Ok(listed),
        }
    }
}

/// Stores the connector's answer. Answering twice overwrites the first answer.
pub async fn answer(
    tx: &mut dyn Transaction,
    id: Id,
    bearer_token: String,
    credential_expires_at: DateTime<Utc>,
) -> Result<DestinationCredential, AppError> {
    let mut request = tx.get_destination_credential(id).await?;
    request.answered = true;
    request.bearer_token = Some(bearer_token);
    request.credential_expires_at = Some(credential_expires_at);
    tx.answer_destination_credential(&request).await?;
    tracing::debug!(request_id = %id, destination_id = %request.destination_id, "Answered credential request");
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryStore;
    use crate::models::{Grant, Identity, Organization, Subject};
    use crate::services::broker::Broker;
    use crate::services::organizations;
    use std::time::Duration;

    struct Setup {
        store: Arc<dyn Store>,
        org: Organization,
        user: Identity,
        destination: Destination,
    }

    async fn setup(with_grant: bool) -> Setup {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new("acme", "acme.example.com", Id(0));
        organizations::create(tx.as_mut(), &mut org).await.unwrap();
        let mut user = Identity::new("a@example.com", Id(0));
        tx.create_identity(&mut user).await.unwrap();
        let mut destination = Destination::new("foo", "foo-uid");
        tx.create_destination(&mut destination).await.unwrap();
        if with_grant {
            let mut grant = Grant::new(Subject::User(user.id), "view", "foo");
            tx.create_grant(&mut grant).await.unwrap();
        }
        tx.commit().await.unwrap();
        Setup {
            store,
            org,
            user,
            destination,
        }
    }

    #[tokio::test]
    async fn request_requires_a_destination_grant() {
        let s = setup(false).await;
        let mut tx = s.store.begin(TxOptions::read_write()).await.unwrap();
        tx.set_organization_id(Some(s.org.id));
        let err = create(tx.as_mut(), s.user.id, "foo").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn answer_wakes_the_requester() {
        let s = setup(true).await;
        let broker = Arc::new(Broker::new());

        let mut tx = s.store.begin(TxOptions::read_write()).await.unwrap();
        tx.set_organization_id(Some(s.org.id));
        let request = create(tx.as_mut(), s.user.id, "foo").await.unwrap();
        let changes = broker.subscribe(s.destination.id);
        tx.commit().await.unwrap();
        drop(tx);

        let answerer = {
            let store = Arc::clone(&s.store);
            let broker = Arc::clone(&broker);
            let org_id = s.org.id;
            let destination_id = s.destination.id;
            let id = request.id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
                tx.set_organization_id(Some(org_id));
                answer(tx.as_mut(), id, "abc.123".to_string(), Utc::now() + ChronoDuration::days(1))
                    .await
                    .unwrap();
                tx.commit().await.unwrap();
                broker.notify(destination_id);
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        let answered = wait_for_answer(&s.store, changes, &request, deadline).await.unwrap();
        assert_eq!(answered.bearer_token.as_deref(), Some("abc.123"));
        answerer.await.unwrap();
    }

    #[tokio::test]
    async fn pending_wait_times_out_empty() {
        let s = setup(true).await;
        let broker = Broker::new();
        let changes = broker.subscribe(s.destination.id);
        let deadline = Instant::now() + Duration::from_millis(50);
        let listed = wait_for_pending(&s.store, changes, s.org.id, s.destination.id, 0, deadline)
            .await
            .unwrap();
        assert!(listed.items.is_empty());
    }

    #[tokio::test]
    async fn pending_lists_only_newer_requests() {
        let s = setup(true).await;
        let mut tx = s.store.begin(TxOptions::read_write()).await.unwrap();
        tx.set_organization_id(Some(s.org.id));
        let first = create(tx.as_mut(), s.user.id, "foo").await.unwrap();
        let second = create(tx.as_mut(), s.user.id, "foo").await.unwrap();

        let immediate = list_immediate(tx.as_mut(), &s.destination, 0).await.unwrap().unwrap();
        assert_eq!(immediate.items.len(), 2);
        assert_eq!(immediate.max_update_index, second.update_index);
        assert!(list_immediate(tx.as_mut(), &s.destination, first.update_index)
            .await
            .unwrap()
            .is_none());
        tx.commit().await.unwrap();
        drop(tx);

        let broker = Broker::new();
        let changes = broker.subscribe(s.destination.id);
        let deadline = Instant::now() + Duration::from_millis(50);
        let listed = wait_for_pending(&s.store, changes, s.org.id, s.destination.id, first.update_index, deadline)
            .await
            .unwrap();
        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].id, second.id);
    }
}
