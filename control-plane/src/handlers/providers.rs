use service_core::error::AppError;

use crate::api::migrations::bare_list;
use crate::api::{RequestContext, Route, Routes};
use crate::data::ListProvidersOptions;
use crate::dtos::providers::{ListProvidersRequest, PatchProviderRequest, Provider, ProviderPath, ProviderRequest};
use crate::dtos::{ErrorResponse, ListResponse, ProviderList};
use crate::services::authorize::Requirement;
use crate::services::providers;

const CREATE: Requirement = Requirement::new("providers", "create", super::ADMIN);
const UPDATE: Requirement = Requirement::new("providers", "update", super::ADMIN);
const DELETE: Requirement = Requirement::new("providers", "delete", super::ADMIN);

pub fn register(routes: &mut Routes) {
    routes
        .add(Route::get("/api/providers", list_providers).public().migrate(bare_list()))
        .add(Route::get("/api/providers/:id", get_provider).public())
        .add(Route::post("/api/providers", create_provider).requires(CREATE))
        .add(Route::put("/api/providers/:id", update_provider).requires(UPDATE))
        .add(Route::patch("/api/providers/:id", patch_provider).requires(UPDATE))
        .add(Route::delete("/api/providers/:id", delete_provider).requires(DELETE));
}

/// List the organization's external identity providers. Public so the
/// login page can offer them.
#[utoipa::path(
    get,
    path = "/api/providers",
    params(
        ("name" = Option<String>, Query,),
        ("page" = Option<u32>, Query,),
        ("limit" = Option<u32>, Query,)
    ),
    responses((status = 200, description = "Providers", body = ProviderList)),
    tag = "Providers"
)]
pub async fn list_providers(ctx: RequestContext, req: ListProvidersRequest) -> Result<ListResponse<Provider>, AppError> {
    let pagination = req.page.pagination();
    let opts = ListProvidersOptions {
        name: (!req.name.is_empty()).then(|| req.name.clone()),
        exclude_infra: true,
        pagination: Some(pagination),
    };
    let mut tx = ctx.tx().await?;
    let page = providers::list(tx.as_mut(), opts).await?;
    drop(tx);
    Ok(ListResponse::new(page, pagination, Provider::from))
}

#[utoipa::path(
    get,
    path = "/api/providers/{id}",
    params(("id" = String, Path, description = "Provider id")),
    responses(
        (status = 200, description = "Provider", body = Provider),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    tag = "Providers"
)]
pub async fn get_provider(ctx: RequestContext, req: ProviderPath) -> Result<Provider, AppError> {
    let mut tx = ctx.tx().await?;
    let provider = providers::get(tx.as_mut(), req.id).await?;
    drop(tx);
    Ok(Provider::from(provider))
}

/// Register an OIDC provider. The client secret is sealed before storage.
#[utoipa::path(
    post,
    path = "/api/providers",
    request_body = ProviderRequest,
    responses(
        (status = 201, description = "Provider created", body = Provider),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "A provider with this name exists", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Providers"
)]
pub async fn create_provider(ctx: RequestContext, req: ProviderRequest) -> Result<Provider, AppError> {
    let state = ctx.state();
    let created_by = ctx.user()?.id;
    let mut tx = ctx.tx().await?;
    let provider = providers::create(tx.as_mut(), req.into_input(), created_by, &state.sealer).await?;
    drop(tx);
    Ok(Provider::from(provider))
}

#[utoipa::path(
    put,
    path = "/api/providers/{id}",
    params(("id" = String, Path, description = "Provider id")),
    request_body = ProviderRequest,
    responses(
        (status = 200, description = "Provider updated", body = Provider),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Providers"
)]
pub async fn update_provider(ctx: RequestContext, req: ProviderRequest) -> Result<Provider, AppError> {
    let state = ctx.state();
    let id = req.id;
    if id.is_zero() {
        return Err(AppError::field("id", "is required"));
    }
    let mut tx = ctx.tx().await?;
    let provider = providers::update(tx.as_mut(), id, req.into_input(), &state.sealer, &state.oidc).await?;
    drop(tx);
    Ok(Provider::from(provider))
}

/// Rename a provider or rotate its client secret.
#[utoipa::path(
    patch,
    path = "/api/providers/{id}",
    params(("id" = String, Path, description = "Provider id")),
    request_body = PatchProviderRequest,
    responses(
        (status = 200, description = "Provider updated", body = Provider),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Providers"
)]
pub async fn patch_provider(ctx: RequestContext, req: PatchProviderRequest) -> Result<Provider, AppError> {
    let state = ctx.state();
    let name = (!req.name.is_empty()).then_some(req.name);
    let secret = (!req.client_secret.is_empty()).then_some(req.client_secret);
    let mut tx = ctx.tx().await?;
    let provider = providers::patch(tx.as_mut(), req.id, name, secret, &state.sealer, &state.oidc).await?;
    drop(tx);
    Ok(Provider::from(provider))
}

/// Delete a provider along with its users' keys and provider records.
#[utoipa::path(
    delete,
    path = "/api/providers/{id}",
    params(("id" = String, Path, description = "Provider id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 400, description = "The built-in provider cannot be deleted", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Providers"
)]
pub async fn delete_provider(ctx: RequestContext, req: ProviderPath) -> Result<(), AppError> {
    let state = ctx.state();
    let mut tx = ctx.tx().await?;
    providers::delete(tx.as_mut(), req.id, &state.oidc).await?;
    drop(tx);
    Ok(())
}
