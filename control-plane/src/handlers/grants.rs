use axum::http::StatusCode;
use service_core::error::AppError;

use crate::api::migrations::bare_list;
use crate::api::{Authenticated, RequestContext, Route, Routes};
use crate::data::{DataError, ListGrantsOptions, Transaction};
use crate::dtos::grants::{CreateGrantRequest, CreateGrantResponse, Grant, GrantPath, ListGrantsRequest};
use crate::dtos::{ErrorResponse, GrantList, ListResponse};
use crate::models::Subject;
use crate::services::authorize::Requirement;
use crate::services::grants;
use crate::uid::Id;

const LIST: Requirement = Requirement::new("grants", "list", super::ANY_ROLE);
const READ: Requirement = Requirement::new("grants", "get", super::ANY_ROLE);
const CREATE: Requirement = Requirement::new("grants", "create", super::ADMIN);
const DELETE: Requirement = Requirement::new("grants", "delete", super::ADMIN);

pub fn register(routes: &mut Routes) {
    routes
        .add(
            Route::get("/api/grants", list_grants)
                .requires(LIST)
                .allow_self(lists_own_grants)
                .migrate(bare_list()),
        )
        .add(Route::get("/api/grants/:id", get_grant).requires(READ))
        .add(Route::post("/api/grants", create_grant).requires(CREATE))
        .add(Route::delete("/api/grants/:id", delete_grant).requires(DELETE));
}

fn lists_own_grants(auth: &Authenticated, req: &ListGrantsRequest) -> bool {
    auth.user.as_ref().is_some_and(|u| u.id == req.user)
}

fn not_found_as_bad_request(err: DataError, what: &str, name: &str) -> AppError {
    match err {
        DataError::NotFound => AppError::bad_request(format!("couldn't find {} '{}'", what, name)),
        other => other.into(),
    }
}

async fn resolve_subject(tx: &mut dyn Transaction, req: &CreateGrantRequest) -> Result<Subject, AppError> {
    if !req.user.is_zero() {
        return Ok(Subject::User(req.user));
    }
    if !req.group.is_zero() {
        return Ok(Subject::Group(req.group));
    }
    if !req.user_name.is_empty() {
        let identity = tx
            .get_identity_by_name(&req.user_name)
            .await
            .map_err(|e| not_found_as_bad_request(e, "userName", &req.user_name))?;
        return Ok(Subject::User(identity.id));
    }
    let group = tx
        .get_group_by_name(&req.group_name)
        .await
        .map_err(|e| not_found_as_bad_request(e, "groupName", &req.group_name))?;
    Ok(Subject::Group(group.id))
}

/// List grants. `showInherited` with a user also returns the grants of
/// every group the user is a member of.
#[utoipa::path(
    get,
    path = "/api/grants",
    params(
        ("user" = Option<String>, Query, description = "Grants for this user"),
        ("group" = Option<String>, Query, description = "Grants for this group"),
        ("resource" = Option<String>, Query, description = "Exact resource"),
        ("destination" = Option<String>, Query, description = "A destination and its sub-resources"),
        ("privilege" = Option<String>, Query,),
        ("showInherited" = Option<bool>, Query,),
        ("showSystem" = Option<bool>, Query, description = "Include connector grants"),
        ("page" = Option<u32>, Query,),
        ("limit" = Option<u32>, Query,)
    ),
    responses(
        (status = 200, description = "Grants", body = GrantList),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Grants"
)]
pub async fn list_grants(ctx: RequestContext, req: ListGrantsRequest) -> Result<ListResponse<Grant>, AppError> {
    let pagination = req.page.pagination();
    let subjects = if !req.user.is_zero() {
        vec![Subject::User(req.user)]
    } else if !req.group.is_zero() {
        vec![Subject::Group(req.group)]
    } else {
        Vec::new()
    };
    let opts = ListGrantsOptions {
        subjects,
        resource: (!req.resource.is_empty()).then(|| req.resource.clone()),
        privilege: (!req.privilege.is_empty()).then(|| req.privilege.clone()),
        destination: (!req.destination.is_empty()).then(|| req.destination.clone()),
        exclude_connector: !req.show_system,
        pagination: Some(pagination),
    };
    let mut tx = ctx.tx().await?;
    let page = grants::list(tx.as_mut(), opts, req.show_inherited).await?;
    drop(tx);
    Ok(ListResponse::new(page, pagination, Grant::from))
}

#[utoipa::path(
    get,
    path = "/api/grants/{id}",
    params(("id" = String, Path, description = "Grant id")),
    responses(
        (status = 200, description = "Grant", body = Grant),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Grants"
)]
pub async fn get_grant(ctx: RequestContext, req: GrantPath) -> Result<Grant, AppError> {
    let mut tx = ctx.tx().await?;
    let grant = grants::get(tx.as_mut(), req.id).await?;
    drop(tx);
    Ok(Grant::from(grant))
}

/// Create a grant. Re-creating an existing grant answers 200 with the
/// existing grant and `wasCreated: false`.
#[utoipa::path(
    post,
    path = "/api/grants",
    request_body = CreateGrantRequest,
    responses(
        (status = 201, description = "Grant created", body = CreateGrantResponse),
        (status = 200, description = "Grant already existed", body = CreateGrantResponse),
        (status = 400, description = "Validation error or unknown subject", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Grants"
)]
pub async fn create_grant(ctx: RequestContext, req: CreateGrantRequest) -> Result<CreateGrantResponse, AppError> {
    let created_by: Id = ctx.user()?.id;
    let mut tx = ctx.tx().await?;
    let subject = resolve_subject(tx.as_mut(), &req).await?;
    let created = grants::create(tx.as_mut(), subject, &req.privilege, &req.resource, created_by).await?;
    drop(tx);

    if !created.was_created {
        ctx.set_status(StatusCode::OK);
    }
    Ok(CreateGrantResponse {
        grant: Grant::from(created.grant),
        was_created: created.was_created,
    })
}

#[utoipa::path(
    delete,
    path = "/api/grants/{id}",
    params(("id" = String, Path, description = "Grant id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 400, description = "Would remove the last infra admin", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Grants"
)]
pub async fn delete_grant(ctx: RequestContext, req: GrantPath) -> Result<(), AppError> {
    let mut tx = ctx.tx().await?;
    grants::delete(tx.as_mut(), req.id).await?;
    drop(tx);
    Ok(())
}
