//! Device authorization flow for clients without a browser.

use axum::http::StatusCode;
use chrono::Utc;
use service_core::error::AppError;

use crate::api::{RequestContext, Route, Routes};
use crate::dtos::device::{
    ApproveDeviceFlowRequest, DeviceFlowResponse, DevicePollResponse, PollDeviceFlowRequest,
    StartDeviceFlowRequest,
};
use crate::dtos::ErrorResponse;
use crate::models::access_key::SCOPE_ALLOW_APPROVE_DEVICE_FLOW;
use crate::services::device_flow;

pub fn register(routes: &mut Routes) {
    routes
        .add(Route::post("/api/device", start_device_flow).public())
        .add(Route::post("/api/device/status", poll_device_flow).public())
        .add(Route::post("/api/device/approve", approve_device_flow));
}

/// Start a device login. The user enters `userCode` at `verificationURI`
/// while the device polls with `deviceCode`.
#[utoipa::path(
    post,
    path = "/api/device",
    responses(
        (status = 201, description = "Device login started", body = DeviceFlowResponse),
        (status = 400, description = "Unknown organization", body = ErrorResponse)
    ),
    tag = "Device Flow"
)]
pub async fn start_device_flow(ctx: RequestContext, req: StartDeviceFlowRequest) -> Result<DeviceFlowResponse, AppError> {
    let domain = ctx.organization()?.domain.clone();
    let mut tx = ctx.tx().await?;
    let flow = device_flow::start(tx.as_mut(), &req.client_id, &domain).await?;
    drop(tx);
    Ok(DeviceFlowResponse::from(flow))
}

#[utoipa::path(
    post,
    path = "/api/device/status",
    request_body = PollDeviceFlowRequest,
    responses(
        (status = 200, description = "Current state of the device login", body = DevicePollResponse),
        (status = 404, description = "Unknown device code", body = ErrorResponse)
    ),
    tag = "Device Flow"
)]
pub async fn poll_device_flow(ctx: RequestContext, req: PollDeviceFlowRequest) -> Result<DevicePollResponse, AppError> {
    let state = ctx.state();
    let mut tx = ctx.tx().await?;
    let result = device_flow::poll(
        tx.as_mut(),
        &req.device_code,
        (!req.client_id.is_empty()).then_some(req.client_id.as_str()),
        &state.sealer,
        Utc::now(),
    )
    .await?;
    drop(tx);
    ctx.set_status(StatusCode::OK);
    Ok(DevicePollResponse::from(result))
}

/// Approve a pending device login from a browser session.
#[utoipa::path(
    post,
    path = "/api/device/approve",
    request_body = ApproveDeviceFlowRequest,
    responses(
        (status = 201, description = "Approved"),
        (status = 403, description = "This session may not approve device logins", body = ErrorResponse),
        (status = 404, description = "Unknown user code", body = ErrorResponse),
        (status = 410, description = "The device login expired", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Device Flow"
)]
pub async fn approve_device_flow(ctx: RequestContext, req: ApproveDeviceFlowRequest) -> Result<(), AppError> {
    let state = ctx.state();
    let user = ctx.user()?.clone();
    let key = ctx
        .access_key()
        .filter(|k| k.has_scope(SCOPE_ALLOW_APPROVE_DEVICE_FLOW))
        .ok_or_else(|| AppError::Forbidden("this access key cannot approve device logins".to_string()))?
        .clone();

    let mut tx = ctx.tx().await?;
    device_flow::approve(
        tx.as_mut(),
        &req.user_code,
        &user,
        &key,
        &state.sealer,
        state.config.bcrypt_cost,
        Utc::now(),
    )
    .await?;
    drop(tx);
    Ok(())
}
