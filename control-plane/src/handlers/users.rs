use service_core::error::AppError;

use crate::api::migrations::bare_list;
use crate::api::{Authenticated, RequestContext, Route, Routes};
use crate::data::ListIdentitiesOptions;
use crate::dtos::users::{
    CreateUserRequest, CreateUserResponse, GetUserRequest, ListUsersRequest, UpdateUserRequest,
    UpdateUserResponse, User, UserPath,
};
use crate::dtos::{ErrorResponse, ListResponse, UserList};
use crate::services::authorize::Requirement;
use crate::services::users;

const LIST: Requirement = Requirement::new("users", "list", super::ANY_ROLE);
const READ: Requirement = Requirement::new("users", "get", super::ANY_ROLE);
const CREATE: Requirement = Requirement::new("users", "create", super::ADMIN);
const UPDATE: Requirement = Requirement::new("users", "update", super::ADMIN);
const DELETE: Requirement = Requirement::new("users", "delete", super::ADMIN);

pub fn register(routes: &mut Routes) {
    routes
        .add(Route::get("/api/users", list_users).requires(LIST).migrate(bare_list()))
        .add(Route::get("/api/users/:id", get_user).requires(READ).allow_self(reads_self))
        .add(Route::post("/api/users", create_user).requires(CREATE))
        .add(Route::put("/api/users/:id", update_user).requires(UPDATE).allow_self(updates_self))
        .add(Route::delete("/api/users/:id", delete_user).requires(DELETE));
}

fn reads_self(auth: &Authenticated, req: &GetUserRequest) -> bool {
    auth.user.as_ref().is_some_and(|u| req.id.resolve(u.id) == u.id)
}

fn updates_self(auth: &Authenticated, req: &UpdateUserRequest) -> bool {
    auth.user.as_ref().is_some_and(|u| req.id.resolve(u.id) == u.id)
}

#[utoipa::path(
    get,
    path = "/api/users",
    params(
        ("name" = Option<String>, Query, description = "Exact user name"),
        ("group" = Option<String>, Query, description = "Members of this group"),
        ("ids" = Option<Vec<String>>, Query, description = "Only these users"),
        ("showSystem" = Option<bool>, Query, description = "Include the connector user"),
        ("page" = Option<u32>, Query,),
        ("limit" = Option<u32>, Query,)
    ),
    responses(
        (status = 200, description = "Users", body = UserList),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn list_users(ctx: RequestContext, req: ListUsersRequest) -> Result<ListResponse<User>, AppError> {
    let pagination = req.page.pagination();
    let ids = req.parsed_ids();
    let opts = ListIdentitiesOptions {
        name: (!req.name.is_empty()).then(|| req.name.clone()),
        group_id: (!req.group.is_zero()).then_some(req.group),
        provider_id: None,
        ids: (!ids.is_empty()).then_some(ids),
        pagination: Some(pagination),
    };
    let mut tx = ctx.tx().await?;
    let identities = users::list(tx.as_mut(), &opts, req.show_system).await?;
    drop(tx);
    Ok(ListResponse::new(identities, pagination, User::from))
}

#[utoipa::path(
    get,
    path = "/api/users/{id}",
    params(("id" = String, Path, description = "User id or `self`")),
    responses(
        (status = 200, description = "User", body = User),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn get_user(ctx: RequestContext, req: GetUserRequest) -> Result<User, AppError> {
    let caller = ctx.user()?.id;
    let mut tx = ctx.tx().await?;
    let identity = users::get(tx.as_mut(), req.id.resolve(caller)).await?;
    drop(tx);
    Ok(User::from(identity))
}

/// Create a user. Without email delivery the response carries a one-time
/// password; otherwise the user is sent an invite.
#[utoipa::path(
    post,
    path = "/api/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = CreateUserResponse),
        (status = 400, description = "Validation error or user exists", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn create_user(ctx: RequestContext, req: CreateUserRequest) -> Result<CreateUserResponse, AppError> {
    let state = ctx.state();
    let inviter = ctx.user()?.clone();
    let org = ctx.organization()?.clone();
    let mut tx = ctx.tx().await?;
    let created = users::create(
        tx.as_mut(),
        &req.name,
        &org,
        &inviter,
        state.email.as_ref(),
        state.config.bcrypt_cost,
    )
    .await?;
    drop(tx);

    tracing::info!(user_id = %created.identity.id, created_by = %inviter.id, "Created user");
    Ok(CreateUserResponse {
        id: created.identity.id,
        name: created.identity.name,
        one_time_password: created.one_time_password,
    })
}

/// Change the caller's own password, or as an admin set a one-time
/// password for another user.
#[utoipa::path(
    put,
    path = "/api/users/{id}",
    params(("id" = String, Path, description = "User id or `self`")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "Password updated", body = UpdateUserResponse),
        (status = 400, description = "Validation error or wrong old password", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn update_user(ctx: RequestContext, req: UpdateUserRequest) -> Result<UpdateUserResponse, AppError> {
    let state = ctx.state();
    let caller = ctx.user()?.clone();
    let id = req.id.resolve(caller.id);
    let policy = &state.config.password_policy;
    let cost = state.config.bcrypt_cost;

    let mut tx = ctx.tx().await?;
    if id == caller.id {
        if req.password.is_empty() {
            return Err(AppError::field("password", "is required"));
        }
        users::change_password(
            tx.as_mut(),
            &caller,
            ctx.access_key(),
            &req.old_password,
            &req.password,
            policy,
            cost,
        )
        .await?;
        drop(tx);
        tracing::info!(user_id = %caller.id, "Changed own password");
        return Ok(UpdateUserResponse {
            user: User::from(caller),
            one_time_password: None,
        });
    }

    if !req.password.is_empty() {
        policy.check("password", &req.password)?;
    }
    let identity = users::get(tx.as_mut(), id).await?;
    let password = users::reset_password(tx.as_mut(), &identity, &req.password, cost).await?;
    drop(tx);
    tracing::info!(user_id = %identity.id, reset_by = %caller.id, "Reset user password");
    Ok(UpdateUserResponse {
        user: User::from(identity),
        one_time_password: req.password.is_empty().then_some(password),
    })
}

#[utoipa::path(
    delete,
    path = "/api/users/{id}",
    params(("id" = String, Path, description = "User id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 400, description = "Cannot delete yourself or the connector", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Users"
)]
pub async fn delete_user(ctx: RequestContext, req: UserPath) -> Result<(), AppError> {
    let caller = ctx.user()?.id;
    let mut tx = ctx.tx().await?;
    users::delete(tx.as_mut(), req.id, caller).await?;
    drop(tx);
    Ok(())
}
