//! Per-destination change notifications for the credential request queue.
//!
//! Waiters subscribe before they read, so a change committed between the
//! read and the wait still wakes them. The counter carries no meaning beyond
//! "something changed"; waiters always re-read the queue.

use dashmap::DashMap;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::data::postgres::DESTINATION_CREDENTIALS_CHANNEL;
use crate::uid::Id;

#[derive(Default)]
pub struct Broker {
    channels: DashMap<Id, watch::Sender<u64>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, destination_id: Id) -> watch::Receiver<u64> {
        self.channels
            .entry(destination_id)
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    pub fn notify(&self, destination_id: Id) {
        if let Some(sender) = self.channels.get(&destination_id) {
            sender.send_modify(|v| *v = v.wrapping_add(1));
        }
    }

    /// Drops channels nobody is waiting on.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    /// Relays committed changes from other processes sharing the database.
    pub async fn listen(&self, pool: PgPool, cancel: CancellationToken) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(DESTINATION_CREDENTIALS_CHANNEL).await?;
        tracing::info!(channel = DESTINATION_CREDENTIALS_CHANNEL, "Listening for credential changes");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = listener.recv() => {
                    let notification = received?;
                    match notification.payload().parse::<i64>() {
                        Ok(id) => self.notify(Id(id)),
                        Err(_) => tracing::warn!(payload = notification.payload(), "Ignoring malformed notification"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn notify_wakes_subscribers_of_that_destination() {
        let broker = Broker::new();
        let mut a = broker.subscribe(Id(1));
        let mut b = broker.subscribe(Id(2));

        broker.notify(Id(1));
        tokio::time::timeout(Duration::from_secs(1), a.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), b.changed()).await.is_err());
    }

    #[test]
    fn prune_drops_idle_channels() {
        let broker = Broker::new();
        let rx = broker.subscribe(Id(1));
        broker.subscribe(Id(2));
        broker.prune();
        assert_eq!(broker.channels.len(), 1);
        drop(rx);
        broker.prune();
        assert!(broker.channels.is_empty());
    }
}
