use service_core::error::AppError;

use crate::api::{Authenticated, RequestContext, Route, Routes};
use crate::dtos::organizations::{Organization, OrganizationPath};
use crate::dtos::ErrorResponse;
use crate::models::grant::ROLE_SUPPORT_ADMIN;
use crate::services::authorize::Requirement;

const READ: Requirement = Requirement::new("organizations", "get", &[ROLE_SUPPORT_ADMIN]);

pub fn register(routes: &mut Routes) {
    routes.add(
        Route::get("/api/organizations/:id", get_organization)
            .requires(READ)
            .allow_self(reads_own_organization),
    );
}

fn reads_own_organization(auth: &Authenticated, req: &OrganizationPath) -> bool {
    auth.organization
        .as_ref()
        .is_some_and(|org| req.id.resolve(org.id) == org.id)
}

#[utoipa::path(
    get,
    path = "/api/organizations/{id}",
    params(("id" = String, Path, description = "Organization id or `self`")),
    responses(
        (status = 200, description = "Organization", body = Organization),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Organizations"
)]
pub async fn get_organization(ctx: RequestContext, req: OrganizationPath) -> Result<Organization, AppError> {
    let own = ctx.organization()?.clone();
    let id = req.id.resolve(own.id);
    if id == own.id {
        return Ok(Organization::from(own));
    }
    let mut tx = ctx.tx().await?;
    let org = tx.get_organization(id).await?;
    drop(tx);
    Ok(Organization::from(org))
}
