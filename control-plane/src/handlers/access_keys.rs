//! Access key management.

use chrono::Utc;
use serde_json::Value;
use service_core::error::AppError;

use crate::api::migrations::{bare_list, map_items, rename_key, Migration};
use crate::api::version::Version;
use crate::api::{Authenticated, RequestContext, Route, Routes};
use crate::data::{optional, ListAccessKeysOptions};
use crate::dtos::access_keys::{
    AccessKeyPath, AccessKeyView, CreateAccessKeyRequest, CreateAccessKeyResponse,
    DeleteAccessKeyRequest, ListAccessKeysRequest,
};
use crate::dtos::{AccessKeyList, ErrorResponse, ListResponse};
use crate::models::access_key::SCOPE_ALLOW_CREATE_ACCESS_KEY;
use crate::models::grant::{ROLE_ADMIN, ROLE_VIEW};
use crate::models::AccessKey;
use crate::services::access_keys::{self, DEFAULT_EXPIRY, DEFAULT_INACTIVITY_TIMEOUT};
use crate::services::authorize::{self, Requirement};

const LIST: Requirement = Requirement::new("access keys", "list", &[ROLE_ADMIN, ROLE_VIEW]);
const CREATE: Requirement = Requirement::new("access keys", "create", super::ADMIN);
const DELETE: Requirement = Requirement::new("access keys", "delete", super::ADMIN);

pub fn register(routes: &mut Routes) {
    routes
        .add(
            Route::get("/api/access-keys", list_access_keys)
                .requires(LIST)
                .allow_self(lists_own_keys)
                .migrate(bare_list())
                .migrate(Migration::request(Version::new(0, 16, 1), legacy_query_keys))
                .migrate(Migration::response(Version::new(0, 18, 0), legacy_extension_deadline))
                .migrate(Migration::response(Version::new(0, 20, 0), legacy_issued_for_user)),
        )
        .add(
            Route::post("/api/access-keys", create_access_key)
                .requires(CREATE)
                .allow_self(creates_own_key),
        )
        .add(Route::delete("/api/access-keys/:id", delete_access_key))
        .add(Route::delete("/api/access-keys", delete_access_key_by_name));
}

fn lists_own_keys(auth: &Authenticated, req: &ListAccessKeysRequest) -> bool {
    auth.user.as_ref().is_some_and(|u| u.id == req.user_id)
}

/// Users may mint keys for themselves only with a session that allows it;
/// keys created through this endpoint cannot mint further keys.
fn creates_own_key(auth: &Authenticated, req: &CreateAccessKeyRequest) -> bool {
    let own = auth.user.as_ref().is_some_and(|u| u.id == req.user_id);
    let allowed = auth
        .access_key
        .as_ref()
        .is_some_and(|k| k.has_scope(SCOPE_ALLOW_CREATE_ACCESS_KEY));
    own && allowed
}

fn legacy_query_keys(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            rename_key(&mut object, "user_id", "userID");
            rename_key(&mut object, "show_expired", "showExpired");
            Value::Object(object)
        }
        other => other,
    }
}

fn legacy_extension_deadline(value: Value) -> Value {
    map_items(value, |item| {
        rename_key(item, "inactivityTimeout", "extensionDeadline");
        item.remove("scopes");
    })
}

fn legacy_issued_for_user(value: Value) -> Value {
    map_items(value, |item| rename_key(item, "issuedForName", "issuedForUser"))
}

/// List access keys, optionally for one user.
#[utoipa::path(
    get,
    path = "/api/access-keys",
    params(
        ("userID" = Option<String>, Query, description = "Only keys issued for this user"),
        ("name" = Option<String>, Query, description = "Only keys with this name"),
        ("showExpired" = Option<bool>, Query, description = "Include expired keys"),
        ("page" = Option<u32>, Query,),
        ("limit" = Option<u32>, Query,)
    ),
    responses(
        (status = 200, description = "Access keys", body = AccessKeyList),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Access Keys"
)]
pub async fn list_access_keys(
    ctx: RequestContext,
    req: ListAccessKeysRequest,
) -> Result<ListResponse<AccessKeyView>, AppError> {
    let pagination = req.page.pagination();
    let opts = ListAccessKeysOptions {
        issued_for: (!req.user_id.is_zero()).then_some(req.user_id),
        name: (!req.name.is_empty()).then(|| req.name.clone()),
        include_expired: req.show_expired,
        pagination: Some(pagination),
    };
    let mut tx = ctx.tx().await?;
    let keys = access_keys::list(tx.as_mut(), &opts).await?;
    drop(tx);
    Ok(ListResponse::new(keys, pagination, AccessKeyView::from))
}

/// Create an access key. The secret is only ever returned here.
///
/// `userID` may also name an identity provider, which yields a key for
/// that provider's SCIM client.
#[utoipa::path(
    post,
    path = "/api/access-keys",
    request_body = CreateAccessKeyRequest,
    responses(
        (status = 201, description = "Access key created", body = CreateAccessKeyResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 409, description = "A key with this name exists", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Access Keys"
)]
pub async fn create_access_key(
    ctx: RequestContext,
    req: CreateAccessKeyRequest,
) -> Result<CreateAccessKeyResponse, AppError> {
    let now = Utc::now();
    let cost = ctx.state().config.bcrypt_cost;
    let mut tx = ctx.tx().await?;

    let mut key = match optional(tx.get_identity(req.user_id).await)? {
        Some(identity) => {
            let infra = tx.get_infra_provider().await?;
            let mut key = AccessKey::new(identity.id, infra.id);
            key.issued_for_name = identity.name;
            key
        }
        None => {
            let provider = tx.get_provider(req.user_id).await?;
            let mut key = AccessKey::new(provider.id, provider.id);
            key.issued_for_name = provider.name;
            key
        }
    };

    key.id = crate::uid::Id::new();
    key.name = if req.name.is_empty() {
        format!("{}-{}", key.issued_for_name, key.id)
    } else {
        req.name
    };
    let expiry = req.expiry.map_or(DEFAULT_EXPIRY, |d| d.0);
    key.expires_at = chrono::Duration::from_std(expiry)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| AppError::field("expiry", "is too long"))?;
    key.inactivity_extension = req.inactivity_timeout.map_or(DEFAULT_INACTIVITY_TIMEOUT, |d| d.0);

    let issued = access_keys::issue(tx.as_mut(), key, cost).await?;
    drop(tx);

    tracing::info!(key_id = %issued.key.key_id, issued_for = %issued.key.issued_for, "Created access key");
    let key = issued.key;
    Ok(CreateAccessKeyResponse {
        id: key.id,
        created: key.created_at,
        name: key.name,
        issued_for: key.issued_for,
        provider_id: key.provider_id,
        expires: key.expires_at,
        inactivity_timeout: key.inactivity_timeout_at,
        access_key: issued.bearer,
    })
}

/// Delete an access key by id. Deleting another user's key needs the admin role.
#[utoipa::path(
    delete,
    path = "/api/access-keys/{id}",
    params(("id" = String, Path, description = "Access key id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 400, description = "The key authenticates this request", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Access Keys"
)]
pub async fn delete_access_key(ctx: RequestContext, req: AccessKeyPath) -> Result<(), AppError> {
    let user_id = ctx.user()?.id;
    let current = ctx.access_key().map(|k| k.id);
    let mut tx = ctx.tx().await?;
    let key = access_keys::get(tx.as_mut(), req.id).await?;
    if key.issued_for != user_id {
        authorize::require_infra_role(tx.as_mut(), user_id, &DELETE).await?;
    }
    access_keys::delete(tx.as_mut(), req.id, current).await?;
    drop(tx);
    Ok(())
}

/// Delete the caller's access keys with the given name.
#[utoipa::path(
    delete,
    path = "/api/access-keys",
    params(("name" = String, Query, description = "Access key name")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Access Keys"
)]
pub async fn delete_access_key_by_name(ctx: RequestContext, req: DeleteAccessKeyRequest) -> Result<(), AppError> {
    let user_id = ctx.user()?.id;
    let current = ctx.access_key().map(|k| k.id);
    let mut tx = ctx.tx().await?;
    access_keys::delete_by_name(tx.as_mut(), user_id, &req.name, current).await?;
    drop(tx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn old_clients_see_renamed_fields() {
        let current = json!({"items": [{
            "issuedForName": "jane@example.com",
            "inactivityTimeout": "2030-01-01T00:00:00Z",
            "scopes": []
        }]});
        let old = legacy_extension_deadline(legacy_issued_for_user(current));
        let item = &old["items"][0];
        assert_eq!(item["issuedForUser"], "jane@example.com");
        assert_eq!(item["extensionDeadline"], "2030-01-01T00:00:00Z");
        assert!(item.get("scopes").is_none());
    }

    #[test]
    fn old_query_keys_are_upgraded() {
        let upgraded = legacy_query_keys(json!({"user_id": "abc", "show_expired": "true"}));
        assert_eq!(upgraded, json!({"userID": "abc", "showExpired": "true"}));
    }
}
