use axum::{extract::State, Json};
use service_core::error::AppError;

use crate::api::{EmptyRequest, RequestContext, Route, Routes};
use crate::dtos::VersionResponse;
use crate::AppState;

pub fn register(routes: &mut Routes) {
    routes.add(
        Route::get("/api/version", version)
            .public()
            .without_organization()
            .unversioned(),
    );
}

#[utoipa::path(
    get,
    path = "/api/version",
    responses((status = 200, description = "Server version", body = VersionResponse)),
    tag = "Observability"
)]
pub async fn version(ctx: RequestContext, _req: EmptyRequest) -> Result<VersionResponse, AppError> {
    Ok(VersionResponse {
        version: ctx.state().config.service_version.clone(),
    })
}

/// Service health check
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Service is unhealthy")
    ),
    tag = "Observability"
)]
pub async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Database health check failed");
        AppError::ServiceUnavailable
    })?;

    state.limiter.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Rate limit store health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "database": "up",
            "rate_limit": "up"
        }
    })))
}
