pub mod api;
pub mod config;
pub mod data;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod uid;
pub mod utils;

use axum::{
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::sync::Arc;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use utoipa::{openapi::security::SecurityScheme, Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{Environment, ServerConfig};
use crate::data::Store;
use crate::models::Organization;
use crate::services::broker::Broker;
use crate::services::crypto::Sealer;
use crate::services::email::EmailProvider;
use crate::services::limiter::Limiter;
use crate::services::login::Authenticator;
use crate::services::oidc::OidcClient;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::system::health_check,
        handlers::system::version,
        handlers::auth::login,
        handlers::auth::logout,
        handlers::auth::signup,
        handlers::auth::request_password_reset,
        handlers::auth::reset_password,
        handlers::auth::verify_email,
        handlers::access_keys::list_access_keys,
        handlers::access_keys::create_access_key,
        handlers::access_keys::delete_access_key,
        handlers::access_keys::delete_access_key_by_name,
        handlers::users::list_users,
        handlers::users::get_user,
        handlers::users::create_user,
        handlers::users::update_user,
        handlers::users::delete_user,
        handlers::groups::list_groups,
        handlers::groups::get_group,
        handlers::groups::create_group,
        handlers::groups::delete_group,
        handlers::groups::update_users_in_group,
        handlers::grants::list_grants,
        handlers::grants::get_grant,
        handlers::grants::create_grant,
        handlers::grants::delete_grant,
        handlers::destinations::list_destinations,
        handlers::destinations::get_destination,
        handlers::destinations::create_destination,
        handlers::destinations::update_destination,
        handlers::destinations::delete_destination,
        handlers::providers::list_providers,
        handlers::providers::get_provider,
        handlers::providers::create_provider,
        handlers::providers::update_provider,
        handlers::providers::patch_provider,
        handlers::providers::delete_provider,
        handlers::device::start_device_flow,
        handlers::device::poll_device_flow,
        handlers::device::approve_device_flow,
        handlers::credentials::create_destination_credential,
        handlers::credentials::list_destination_credentials,
        handlers::credentials::answer_destination_credential,
        handlers::scim::list_scim_users,
        handlers::scim::get_scim_user,
        handlers::organizations::get_organization,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::FieldError,
            dtos::VersionResponse,
            dtos::AccessKeyList,
            dtos::UserList,
            dtos::GroupList,
            dtos::GrantList,
            dtos::DestinationList,
            dtos::ProviderList,
            dtos::auth::PasswordCredentials,
            dtos::auth::OidcCredentials,
            dtos::auth::LoginRequest,
            dtos::auth::LoginResponse,
            dtos::auth::SignupUser,
            dtos::auth::SignupOrg,
            dtos::auth::SignupRequest,
            dtos::auth::SignupResponse,
            dtos::auth::PasswordResetRequest,
            dtos::auth::VerifiedPasswordResetRequest,
            dtos::access_keys::AccessKeyView,
            dtos::access_keys::CreateAccessKeyRequest,
            dtos::access_keys::CreateAccessKeyResponse,
            dtos::users::User,
            dtos::users::CreateUserRequest,
            dtos::users::CreateUserResponse,
            dtos::users::UpdateUserRequest,
            dtos::users::UpdateUserResponse,
            dtos::groups::Group,
            dtos::groups::CreateGroupRequest,
            dtos::groups::UpdateUsersInGroupRequest,
            dtos::grants::Grant,
            dtos::grants::CreateGrantRequest,
            dtos::grants::CreateGrantResponse,
            dtos::destinations::Destination,
            dtos::destinations::DestinationConnection,
            dtos::destinations::DestinationRequest,
            dtos::providers::Provider,
            dtos::providers::ProviderApiCredentials,
            dtos::providers::ProviderRequest,
            dtos::providers::PatchProviderRequest,
            dtos::device::DeviceFlowResponse,
            dtos::device::PollDeviceFlowRequest,
            dtos::device::DeviceLogin,
            dtos::device::DevicePollResponse,
            dtos::device::ApproveDeviceFlowRequest,
            dtos::credentials::DestinationCredential,
            dtos::credentials::CreateDestinationCredentialRequest,
            dtos::credentials::ListDestinationCredentialResponse,
            dtos::credentials::AnswerDestinationCredentialRequest,
            dtos::scim::ScimName,
            dtos::scim::ScimEmail,
            dtos::scim::ScimMeta,
            dtos::scim::ScimUser,
            dtos::scim::ScimListResponse,
            dtos::organizations::Organization,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Login, logout, signup and password reset"),
        (name = "Access Keys", description = "Bearer access keys"),
        (name = "Users", description = "User identities"),
        (name = "Groups", description = "Groups and membership"),
        (name = "Grants", description = "Role grants on resources"),
        (name = "Destinations", description = "Registered destinations and their connectors"),
        (name = "Providers", description = "External OIDC identity providers"),
        (name = "Device Flow", description = "Login for devices without a browser"),
        (name = "Destination Credentials", description = "Credential requests brokered to connectors"),
        (name = "SCIM", description = "SCIM v2 user directory"),
        (name = "Organizations", description = "Tenant organizations"),
        (name = "Observability", description = "Service health and version"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .build(),
                ),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub limiter: Arc<Limiter>,
    pub email: Arc<dyn EmailProvider>,
    pub sealer: Arc<Sealer>,
    pub oidc: Arc<OidcClient>,
    pub broker: Arc<Broker>,
    /// Serves hosts that match no organization. Set when signup is disabled.
    pub default_org: Option<Organization>,
    pub signup_rate_limiter: IpRateLimiter,
}

impl AppState {
    pub fn authenticator(&self) -> Authenticator<'_> {
        Authenticator {
            limiter: &self.limiter,
            oidc: &self.oidc,
            sealer: &self.sealer,
            session: &self.config.session,
            bcrypt_cost: self.config.bcrypt_cost,
        }
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins = config
        .allowed_origins
        .iter()
        .filter(|o| o.as_str() != "*")
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<HeaderValue>>();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(api::version::HEADER),
            HeaderName::from_static(middleware::authn::DESTINATION_HEADER),
        ])
        .expose_headers([HeaderName::from_static("last-update-index")])
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let signup_route = handlers::auth::signup_routes()
        .into_router()
        .layer(from_fn_with_state(
            state.signup_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let mut app = Router::new()
        .route("/healthz", get(handlers::system::health_check))
        .merge(handlers::api_routes().into_router())
        .merge(signup_route);

    app = match state.config.environment {
        Environment::Dev => {
            app.merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()))
        }
        Environment::Prod => app.route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        ),
    };

    let app = app
        .with_state(state.clone())
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-");

            tracing::info_span!(
                "http_request",
                request_id = %request_id,
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
            )
        }))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state.config));

    Ok(app)
}
