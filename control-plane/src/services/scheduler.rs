//! Periodic purges of expired rows.
//!
//! Every job runs on its own interval until the token is cancelled. A job that
//! fails or panics is logged and runs again on the next tick.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use service_core::error::AppError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::data::{Store, Transaction, TxOptions};
use crate::services::broker::Broker;

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, Result<u64, AppError>> + Send + Sync>;

struct Job {
    name: &'static str,
    every: Duration,
    run: JobFn,
}

/// Runs one purge in its own transaction, across all organizations.
async fn purge<F>(store: Arc<dyn Store>, delete: F) -> Result<u64, AppError>
where
    F: for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, Result<u64, crate::data::DataError>>,
{
    let mut tx = store.begin(TxOptions::read_write()).await?;
    let deleted = delete(tx.as_mut()).await?;
    tx.commit().await?;
    Ok(deleted)
}

fn jobs(store: Arc<dyn Store>, broker: Arc<Broker>, config: &SchedulerConfig) -> Vec<Job> {
    let s = Arc::clone(&store);
    let device_flow: JobFn = Arc::new(move || {
        purge(Arc::clone(&s), |tx| tx.delete_expired_device_flow_auth_requests(Utc::now())).boxed()
    });

    let s = Arc::clone(&store);
    let access_keys: JobFn = Arc::new(move || {
        purge(Arc::clone(&s), |tx| tx.delete_expired_access_keys(Utc::now())).boxed()
    });

    let s = Arc::clone(&store);
    let password_resets: JobFn = Arc::new(move || {
        purge(Arc::clone(&s), |tx| tx.delete_expired_password_reset_tokens(Utc::now())).boxed()
    });

    let s = Arc::clone(&store);
    let verifications: JobFn = Arc::new(move || {
        purge(Arc::clone(&s), |tx| tx.delete_expired_email_verification_tokens(Utc::now())).boxed()
    });

    let s = Arc::clone(&store);
    let credentials: JobFn = Arc::new(move || {
        purge(Arc::clone(&s), |tx| tx.delete_expired_destination_credentials(Utc::now())).boxed()
    });

    let prune: JobFn = Arc::new(move || {
        let broker = Arc::clone(&broker);
        async move {
            broker.prune();
            Ok(0)
        }
        .boxed()
    });

    vec![
        Job {
            name: "device_flow_requests",
            every: config.device_flow_purge_interval,
            run: device_flow,
        },
        Job {
            name: "access_keys",
            every: config.access_key_purge_interval,
            run: access_keys,
        },
        Job {
            name: "password_reset_tokens",
            every: config.password_reset_purge_interval,
            run: password_resets,
        },
        Job {
            name: "email_verification_tokens",
            every: config.password_reset_purge_interval,
            run: verifications,
        },
        Job {
            name: "destination_credentials",
            every: config.destination_credential_purge_interval,
            run: credentials,
        },
        Job {
            name: "broker_channels",
            every: config.destination_credential_purge_interval,
            run: prune,
        },
    ]
}

async fn run_job(job: Job, cancel: CancellationToken) {
    if job.every.is_zero() {
        tracing::warn!(job = job.name, "Scheduled job has a zero interval and is disabled");
        return;
    }
    let mut ticker = interval(job.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(job = job.name, "Scheduled job stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        // Dropping an in-flight purge rolls its transaction back.
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(job = job.name, "Scheduled job stopping mid-run");
                return;
            }
            outcome = AssertUnwindSafe((job.run)()).catch_unwind() => outcome,
        };
        match outcome {
            Ok(Ok(0)) => {}
            Ok(Ok(deleted)) => tracing::info!(job = job.name, deleted, "Purged expired records"),
            Ok(Err(e)) => tracing::error!(job = job.name, error = %e, "Scheduled job failed"),
            Err(_) => tracing::error!(job = job.name, "Scheduled job panicked"),
        }
    }
}

/// Spawns every purge job. The handles finish after `cancel` fires.
pub fn spawn(
    store: Arc<dyn Store>,
    broker: Arc<Broker>,
    config: &SchedulerConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    jobs(store, broker, config)
        .into_iter()
        .map(|job| {
            tracing::info!(job = job.name, every = ?job.every, "Scheduled job registered");
            tokio::spawn(run_job(job, cancel.clone()))
        })
        .collect()
}
