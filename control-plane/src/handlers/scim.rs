//! Read side of SCIM v2 users, for identity providers that push their directory.

use service_core::error::AppError;

use crate::api::{RequestContext, Route, Routes};
use crate::data::{ListProviderUsersOptions, Pagination, Transaction};
use crate::dtos::scim::{ScimListRequest, ScimListResponse, ScimUser, ScimUserPath, LIST_RESPONSE_SCHEMA};
use crate::dtos::ErrorResponse;
use crate::models::grant::{RESOURCE_INFRA, ROLE_ADMIN};
use crate::models::ProviderUser;
use crate::services::authorize;
use crate::uid::Id;

pub fn register(routes: &mut Routes) {
    routes
        .add(Route::get("/api/scim/v2/Users", list_scim_users))
        .add(Route::get("/api/scim/v2/Users/:id", get_scim_user));
}

/// Which provider's users the caller may read: a provider key sees its own
/// provider, an admin sees every provider.
async fn provider_scope(ctx: &RequestContext, tx: &mut dyn Transaction) -> Result<Option<Id>, AppError> {
    match ctx.user() {
        Ok(user) => {
            if authorize::has_role(tx, user.id, RESOURCE_INFRA, &[ROLE_ADMIN]).await? {
                Ok(None)
            } else {
                Err(AppError::Forbidden("only identity providers may read SCIM users".to_string()))
            }
        }
        Err(_) => ctx
            .access_key()
            .map(|key| Some(key.issued_for))
            .ok_or_else(|| AppError::unauthorized("no access key")),
    }
}

/// Converts one-based item offsets into the page the store understands.
fn scim_pagination(req: &ScimListRequest) -> Pagination {
    let count = req.count();
    Pagination {
        page: (req.start_index() - 1) / count + 1,
        limit: count,
    }
}

#[utoipa::path(
    get,
    path = "/api/scim/v2/Users",
    params(
        ("startIndex" = Option<u32>, Query, description = "One-based index of the first result"),
        ("count" = Option<u32>, Query, description = "Results per page")
    ),
    responses(
        (status = 200, description = "SCIM list response", body = ScimListResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "SCIM"
)]
pub async fn list_scim_users(ctx: RequestContext, req: ScimListRequest) -> Result<ScimListResponse, AppError> {
    let pagination = scim_pagination(&req);
    let mut tx = ctx.tx().await?;
    let provider_id = provider_scope(&ctx, tx.as_mut()).await?;
    let page = tx
        .list_provider_users(&ListProviderUsersOptions {
            provider_id,
            pagination: Some(pagination),
        })
        .await?;
    drop(tx);

    let resources: Vec<ScimUser> = page.items.into_iter().map(ScimUser::from).collect();
    Ok(ScimListResponse {
        schemas: vec![LIST_RESPONSE_SCHEMA.to_string()],
        total_results: page.total_count,
        start_index: req.start_index(),
        items_per_page: resources.len() as u32,
        resources,
    })
}

#[utoipa::path(
    get,
    path = "/api/scim/v2/Users/{id}",
    params(("id" = String, Path, description = "User id")),
    responses(
        (status = 200, description = "SCIM user", body = ScimUser),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "SCIM"
)]
pub async fn get_scim_user(ctx: RequestContext, req: ScimUserPath) -> Result<ScimUser, AppError> {
    let mut tx = ctx.tx().await?;
    let user: ProviderUser = match provider_scope(&ctx, tx.as_mut()).await? {
        Some(provider_id) => tx.get_provider_user(provider_id, req.id).await?,
        None => tx
            .list_provider_users(&ListProviderUsersOptions::default())
            .await?
            .items
            .into_iter()
            .find(|u| u.identity_id == req.id)
            .ok_or_else(AppError::not_found)?,
    };
    drop(tx);
    Ok(ScimUser::from(user))
}
