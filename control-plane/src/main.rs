use control_plane::{
    build_router,
    config::{Environment, ServerConfig},
    data::{MemoryStore, PgStore, Store},
    db,
    services::{
        broker::Broker,
        crypto::Sealer,
        email::{EmailProvider, EmailService, NoopEmailService},
        limiter::{Limiter, RedisCounters},
        oidc::OidcClient,
        organizations, scheduler,
    },
    AppState,
};
use service_core::error::AppError;
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use service_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = ServerConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.common.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting control plane"
    );

    let cancel = CancellationToken::new();
    let broker = Arc::new(Broker::new());

    let store: Arc<dyn Store> = if config.database.is_memory() {
        tracing::warn!("Using the in-memory store; data is lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        let pool = db::connect(&config.database).await?;

        let listener = broker.clone();
        let listener_pool = pool.clone();
        let listener_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.listen(listener_pool, listener_cancel).await {
                tracing::error!(error = %e, "Credential change listener stopped");
            }
        });
        Arc::new(PgStore::new(pool))
    };
    tracing::info!("Store initialized");

    let limiter = match &config.redis {
        Some(redis) => {
            let counters = RedisCounters::new(redis).await?;
            tracing::info!("Rate limits shared through Redis");
            Limiter::new(Arc::new(counters), config.rate_limit.clone())
        }
        None => Limiter::in_memory(config.rate_limit.clone()),
    };

    let email: Arc<dyn EmailProvider> = match &config.smtp {
        Some(smtp) => {
            let service = EmailService::new(smtp)?;
            tracing::info!("Email service initialized");
            Arc::new(service)
        }
        None => Arc::new(NoopEmailService),
    };

    let sealer = Sealer::load(&config.key_provider, config.environment == Environment::Prod)?;
    let oidc = OidcClient::new(config.oidc.http_timeout)?;

    let default_org = if config.signup.enabled {
        None
    } else {
        let org = organizations::ensure_default(&store, &config.signup).await?;
        tracing::info!(org_id = %org.id, domain = %org.domain, "Default organization ready");
        Some(org)
    };

    let signup_rate_limiter = create_ip_rate_limiter(config.rate_limit.signup_per_ip_per_hour, 3600);

    let jobs = scheduler::spawn(store.clone(), broker.clone(), &config.scheduler, cancel.clone());

    let state = AppState {
        config: config.clone(),
        store,
        limiter: Arc::new(limiter),
        email,
        sealer: Arc::new(sealer),
        oidc: Arc::new(oidc),
        broker,
        default_org,
        signup_rate_limiter,
    };
    let app = build_router(state).await?;

    let addr: SocketAddr = config.common.bind_address().parse().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("invalid bind address: {}", e))
    })?;

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cancel.cancel();
    for job in jobs {
        if let Err(e) = job.await {
            tracing::warn!(error = %e, "Scheduled job did not stop cleanly");
        }
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
