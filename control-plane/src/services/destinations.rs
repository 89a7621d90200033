use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;

use crate::data::{ListDestinationsOptions, Paged, Transaction};
use crate::models::Destination;
use crate::uid::Id;

/// Writes to `last_seen_at` closer together than this are skipped.
const LAST_SEEN_DAMPING: Duration = Duration::seconds(2);

/// The mutable fields of a destination, as sent by its connector.
#[derive(Debug, Clone, Default)]
pub struct DestinationFields {
    pub name: String,
    pub unique_id: String,
    pub kind: String,
    pub connection_url: String,
    pub connection_ca: String,
    pub resources: Vec<String>,
    pub roles: Vec<String>,
    pub version: String,
}

impl DestinationFields {
    fn apply(self, destination: &mut Destination) {
        destination.name = self.name;
        destination.unique_id = self.unique_id;
        if !self.kind.is_empty() {
            destination.kind = self.kind;
        }
        destination.connection_url = self.connection_url;
        destination.connection_ca = self.connection_ca;
        destination.resources = self.resources;
        destination.roles = self.roles;
        destination.version = self.version;
    }
}

pub async fn list(
    tx: &mut dyn Transaction,
    opts: &ListDestinationsOptions,
) -> Result<Paged<Destination>, AppError> {
    Ok(tx.list_destinations(opts).await?)
}

pub async fn get(tx: &mut dyn Transaction, id: Id) -> Result<Destination, AppError> {
    Ok(tx.get_destination(id).await?)
}

/// Registers a destination. `seen` marks a registration made by the
/// destination's own connector, which counts as a check-in.
pub async fn create(
    tx: &mut dyn Transaction,
    fields: DestinationFields,
    seen: bool,
) -> Result<Destination, AppError> {
    let mut destination = Destination::new(String::new(), String::new());
    fields.apply(&mut destination);
    if seen {
        destination.last_seen_at = Some(Utc::now());
    }
    tx.create_destination(&mut destination).await?;
    tracing::info!(destination_id = %destination.id, name = %destination.name, "Registered destination");
    Ok(destination)
}

/// Replaces every mutable field; the connection CA is stored byte-for-byte.
pub async fn update(
    tx: &mut dyn Transaction,
    id: Id,
    fields: DestinationFields,
) -> Result<Destination, AppError> {
    let mut destination = tx.get_destination(id).await?;
    fields.apply(&mut destination);
    destination.updated_at = Utc::now();
    tx.update_destination(&destination).await?;
    Ok(destination)
}

pub async fn delete(tx: &mut dyn Transaction, id: Id) -> Result<(), AppError> {
    tx.delete_destination(id).await?;
    Ok(())
}

/// Records a connector check-in for the destination with `unique_id`.
/// Unknown destinations are ignored; they register themselves later.
pub async fn touch(tx: &mut dyn Transaction, unique_id: &str, now: DateTime<Utc>) -> Result<(), AppError> {
    let destination = match tx.get_destination_by_unique_id(unique_id).await {
        Ok(d) => d,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if destination
        .last_seen_at
        .is_some_and(|seen| now - seen < LAST_SEEN_DAMPING)
    {
        return Ok(());
    }
    tx.update_destination_last_seen(destination.id, now).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryStore, Store, TxOptions};
    use crate::models::Organization;

    fn fields(name: &str) -> DestinationFields {
        DestinationFields {
            name: name.to_string(),
            unique_id: format!("{}-uid", name),
            connection_ca: "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n".to_string(),
            ..Default::default()
        }
    }

    async fn tx() -> Box<dyn Transaction> {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new("acme", "acme.example.com", Id(0));
        tx.create_organization(&mut org).await.unwrap();
        tx.set_organization_id(Some(org.id));
        tx
    }

    #[tokio::test]
    async fn create_defaults_kind_and_keeps_ca_bytes() {
        let mut tx = tx().await;
        let created = create(tx.as_mut(), fields("prod"), false).await.unwrap();
        assert_eq!(created.kind, "kubernetes");
        assert!(created.last_seen_at.is_none());

        let stored = get(tx.as_mut(), created.id).await.unwrap();
        assert!(stored.connection_ca.ends_with("-----END CERTIFICATE-----\n"));
    }

    #[tokio::test]
    async fn touch_updates_last_seen() {
        let mut tx = tx().await;
        let created = create(tx.as_mut(), fields("prod"), false).await.unwrap();
        let now = Utc::now();
        touch(tx.as_mut(), "prod-uid", now).await.unwrap();
        let stored = get(tx.as_mut(), created.id).await.unwrap();
        assert!(stored.is_connected(now));

        touch(tx.as_mut(), "unknown", now).await.unwrap();
    }

    #[tokio::test]
    async fn update_replaces_fields() {
        let mut tx = tx().await;
        let created = create(tx.as_mut(), fields("prod"), true).await.unwrap();
        let mut next = fields("prod");
        next.roles = vec!["cluster-admin".to_string()];
        next.version = "0.21.0".to_string();
        let updated = update(tx.as_mut(), created.id, next).await.unwrap();
        assert_eq!(updated.roles, vec!["cluster-admin"]);
        assert_eq!(updated.kind, "kubernetes");
    }
}
