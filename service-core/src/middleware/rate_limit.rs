use crate::error::AppError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
};
use std::{net::SocketAddr, num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter keyed by IP address
pub type IpRateLimiter = Arc<RateLimiter<SocketAddr, DashMapStateStore<SocketAddr>, DefaultClock>>;

fn quota(attempts: u32, window_seconds: u64) -> Quota {
    let attempts = attempts.max(1);
    let burst = NonZeroU32::new(attempts).unwrap_or(NonZeroU32::MIN);
    let period = Duration::from_millis((window_seconds.max(1) * 1000) / attempts as u64);
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}

pub fn create_ip_rate_limiter(attempts: u32, window_seconds: u64) -> IpRateLimiter {
    Arc::new(RateLimiter::dashmap(quota(attempts, window_seconds)))
}

/// Seconds until the next request would be admitted, rounded up.
fn retry_after(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
}

/// Middleware for IP-based rate limiting
pub async fn ip_rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let forwarded_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok());

    let addr = if let Some(ip) = forwarded_ip {
        Some(SocketAddr::new(ip, 0))
    } else {
        request
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|axum::extract::ConnectInfo(addr)| *addr)
    };

    match addr {
        Some(addr) => match limiter.check_key(&addr) {
            Ok(_) => Ok(next.run(request).await),
            Err(negative) => {
                let wait = negative.wait_time_from(DefaultClock::default().now());
                Err(AppError::TooManyRequests(
                    "too many requests from this address".to_string(),
                    Some(retry_after(wait)),
                ))
            }
        },
        None => {
            tracing::debug!("Could not determine IP for rate limiting");
            Ok(next.run(request).await)
        }
    }
}
