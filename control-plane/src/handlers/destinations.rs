use chrono::Utc;
use service_core::error::AppError;

use crate::api::migrations::bare_list;
use crate::api::{RequestContext, Route, Routes};
use crate::data::ListDestinationsOptions;
use crate::dtos::destinations::{Destination, DestinationPath, DestinationRequest, ListDestinationsRequest};
use crate::dtos::{DestinationList, ErrorResponse, ListResponse};
use crate::services::authorize::Requirement;
use crate::services::destinations;

const LIST: Requirement = Requirement::new("destinations", "list", super::ANY_ROLE);
const READ: Requirement = Requirement::new("destinations", "get", super::ANY_ROLE);
const CREATE: Requirement = Requirement::new("destinations", "create", super::ADMIN_OR_CONNECTOR);
const UPDATE: Requirement = Requirement::new("destinations", "update", super::ADMIN_OR_CONNECTOR);
const DELETE: Requirement = Requirement::new("destinations", "delete", super::ADMIN);

pub fn register(routes: &mut Routes) {
    routes
        .add(Route::get("/api/destinations", list_destinations).requires(LIST).migrate(bare_list()))
        .add(Route::get("/api/destinations/:id", get_destination).requires(READ))
        .add(Route::post("/api/destinations", create_destination).requires(CREATE))
        .add(Route::put("/api/destinations/:id", update_destination).requires(UPDATE))
        .add(Route::delete("/api/destinations/:id", delete_destination).requires(DELETE));
}

#[utoipa::path(
    get,
    path = "/api/destinations",
    params(
        ("name" = Option<String>, Query,),
        ("kind" = Option<String>, Query,),
        ("uniqueID" = Option<String>, Query,),
        ("page" = Option<u32>, Query,),
        ("limit" = Option<u32>, Query,)
    ),
    responses(
        (status = 200, description = "Destinations", body = DestinationList),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Destinations"
)]
pub async fn list_destinations(
    ctx: RequestContext,
    req: ListDestinationsRequest,
) -> Result<ListResponse<Destination>, AppError> {
    let pagination = req.page.pagination();
    let opts = ListDestinationsOptions {
        name: (!req.name.is_empty()).then(|| req.name.clone()),
        kind: (!req.kind.is_empty()).then(|| req.kind.clone()),
        unique_id: (!req.unique_id.is_empty()).then(|| req.unique_id.clone()),
        pagination: Some(pagination),
    };
    let mut tx = ctx.tx().await?;
    let page = destinations::list(tx.as_mut(), &opts).await?;
    drop(tx);
    let now = Utc::now();
    Ok(ListResponse::new(page, pagination, |d| Destination::new(d, now)))
}

#[utoipa::path(
    get,
    path = "/api/destinations/{id}",
    params(("id" = String, Path, description = "Destination id")),
    responses(
        (status = 200, description = "Destination", body = Destination),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Destinations"
)]
pub async fn get_destination(ctx: RequestContext, req: DestinationPath) -> Result<Destination, AppError> {
    let mut tx = ctx.tx().await?;
    let destination = destinations::get(tx.as_mut(), req.id).await?;
    drop(tx);
    Ok(Destination::new(destination, Utc::now()))
}

/// Register a destination. A connector registering itself counts as a check-in.
#[utoipa::path(
    post,
    path = "/api/destinations",
    request_body = DestinationRequest,
    responses(
        (status = 201, description = "Destination registered", body = Destination),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "A destination with this name exists", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Destinations"
)]
pub async fn create_destination(ctx: RequestContext, req: DestinationRequest) -> Result<Destination, AppError> {
    let seen = ctx.user()?.is_connector();
    let mut tx = ctx.tx().await?;
    let destination = destinations::create(tx.as_mut(), req.into_fields(), seen).await?;
    drop(tx);
    Ok(Destination::new(destination, Utc::now()))
}

#[utoipa::path(
    put,
    path = "/api/destinations/{id}",
    params(("id" = String, Path, description = "Destination id")),
    request_body = DestinationRequest,
    responses(
        (status = 200, description = "Destination updated", body = Destination),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Destinations"
)]
pub async fn update_destination(ctx: RequestContext, req: DestinationRequest) -> Result<Destination, AppError> {
    let id = req.id;
    if id.is_zero() {
        return Err(AppError::field("id", "is required"));
    }
    let mut tx = ctx.tx().await?;
    let destination = destinations::update(tx.as_mut(), id, req.into_fields()).await?;
    drop(tx);
    Ok(Destination::new(destination, Utc::now()))
}

#[utoipa::path(
    delete,
    path = "/api/destinations/{id}",
    params(("id" = String, Path, description = "Destination id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Destinations"
)]
pub async fn delete_destination(ctx: RequestContext, req: DestinationPath) -> Result<(), AppError> {
    let mut tx = ctx.tx().await?;
    destinations::delete(tx.as_mut(), req.id).await?;
    drop(tx);
    Ok(())
}
