use service_core::error::AppError;

use crate::api::migrations::bare_list;
use crate::api::{Authenticated, RequestContext, Route, Routes};
use crate::data::{ListGroupsOptions, Paged, Transaction};
use crate::dtos::groups::{CreateGroupRequest, Group, GroupPath, ListGroupsRequest, UpdateUsersInGroupRequest};
use crate::dtos::{ErrorResponse, GroupList, ListResponse};
use crate::models;
use crate::services::authorize::Requirement;
use crate::services::groups;

const LIST: Requirement = Requirement::new("groups", "list", super::ANY_ROLE);
const READ: Requirement = Requirement::new("groups", "get", super::ANY_ROLE);
const CREATE: Requirement = Requirement::new("groups", "create", super::ADMIN);
const DELETE: Requirement = Requirement::new("groups", "delete", super::ADMIN);
const UPDATE_USERS: Requirement = Requirement::new("groups", "update users in", super::ADMIN);

pub fn register(routes: &mut Routes) {
    routes
        .add(
            Route::get("/api/groups", list_groups)
                .requires(LIST)
                .allow_self(lists_own_groups)
                .migrate(bare_list()),
        )
        .add(Route::get("/api/groups/:id", get_group).requires(READ))
        .add(Route::post("/api/groups", create_group).requires(CREATE))
        .add(Route::delete("/api/groups/:id", delete_group).requires(DELETE))
        .add(Route::put("/api/groups/:id/users", update_users_in_group).requires(UPDATE_USERS));
}

fn lists_own_groups(auth: &Authenticated, req: &ListGroupsRequest) -> bool {
    auth.user.as_ref().is_some_and(|u| u.id == req.user_id)
}

async fn with_member_count(tx: &mut dyn Transaction, group: models::Group) -> Result<Group, AppError> {
    let total = groups::member_count(tx, group.id).await?;
    Ok(Group::new(group, total))
}

#[utoipa::path(
    get,
    path = "/api/groups",
    params(
        ("name" = Option<String>, Query, description = "Exact group name"),
        ("userID" = Option<String>, Query, description = "Groups this user belongs to"),
        ("page" = Option<u32>, Query,),
        ("limit" = Option<u32>, Query,)
    ),
    responses(
        (status = 200, description = "Groups", body = GroupList),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Groups"
)]
pub async fn list_groups(ctx: RequestContext, req: ListGroupsRequest) -> Result<ListResponse<Group>, AppError> {
    let pagination = req.page.pagination();
    let opts = ListGroupsOptions {
        name: (!req.name.is_empty()).then(|| req.name.clone()),
        member_id: (!req.user_id.is_zero()).then_some(req.user_id),
        pagination: Some(pagination),
    };
    let mut tx = ctx.tx().await?;
    let page = groups::list(tx.as_mut(), &opts).await?;
    let mut items = Vec::with_capacity(page.items.len());
    for group in page.items {
        items.push(with_member_count(tx.as_mut(), group).await?);
    }
    drop(tx);
    let counted = Paged {
        items,
        total_count: page.total_count,
    };
    Ok(ListResponse::new(counted, pagination, |g| g))
}

#[utoipa::path(
    get,
    path = "/api/groups/{id}",
    params(("id" = String, Path, description = "Group id")),
    responses(
        (status = 200, description = "Group", body = Group),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Groups"
)]
pub async fn get_group(ctx: RequestContext, req: GroupPath) -> Result<Group, AppError> {
    let mut tx = ctx.tx().await?;
    let group = groups::get(tx.as_mut(), req.id).await?;
    let group = with_member_count(tx.as_mut(), group).await?;
    drop(tx);
    Ok(group)
}

#[utoipa::path(
    post,
    path = "/api/groups",
    request_body = CreateGroupRequest,
    responses(
        (status = 201, description = "Group created", body = Group),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "A group with this name exists", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Groups"
)]
pub async fn create_group(ctx: RequestContext, req: CreateGroupRequest) -> Result<Group, AppError> {
    let created_by = ctx.user()?.id;
    let mut tx = ctx.tx().await?;
    let group = groups::create(tx.as_mut(), &req.name, created_by).await?;
    drop(tx);
    Ok(Group::new(group, 0))
}

#[utoipa::path(
    delete,
    path = "/api/groups/{id}",
    params(("id" = String, Path, description = "Group id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Groups"
)]
pub async fn delete_group(ctx: RequestContext, req: GroupPath) -> Result<(), AppError> {
    let mut tx = ctx.tx().await?;
    groups::delete(tx.as_mut(), req.id).await?;
    drop(tx);
    Ok(())
}

/// Add and remove members in one call.
#[utoipa::path(
    put,
    path = "/api/groups/{id}/users",
    params(("id" = String, Path, description = "Group id")),
    request_body = UpdateUsersInGroupRequest,
    responses(
        (status = 200, description = "Membership updated"),
        (status = 404, description = "Group or user not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Groups"
)]
pub async fn update_users_in_group(ctx: RequestContext, req: UpdateUsersInGroupRequest) -> Result<(), AppError> {
    let mut tx = ctx.tx().await?;
    groups::update_users(tx.as_mut(), req.id, &req.users_to_add, &req.users_to_remove).await?;
    drop(tx);
    Ok(())
}
