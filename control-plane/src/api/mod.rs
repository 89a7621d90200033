//! The API request pipeline.
//!
//! Every route runs the same steps: read `Infra-Version`, gather the raw
//! request fields, upgrade them for older clients, bind and validate,
//! open the request transaction, authenticate, authorize, call the handler
//! under a timeout, commit, encode, downgrade the response for older
//! clients, and write it.

pub mod binding;
pub mod context;
pub mod cookies;
pub mod migrations;
pub mod version;

use axum::body::{to_bytes, Body};
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use validator::{Validate, ValidationErrors};

use crate::data::TxOptions;
use crate::middleware::{authenticate, AuthMode, RequestInfo};
use crate::services::authorize::{self, Requirement};
use crate::AppState;

pub use context::{Authenticated, RequestContext};
use migrations::{Migration, Migrations};
use version::ClientVersion;

const MAX_BODY_BYTES: usize = 1024 * 1024;

type Handler<Req, Res> = Arc<dyn Fn(RequestContext, Req) -> BoxFuture<'static, Result<Res, AppError>> + Send + Sync>;

/// Lets the caller through before the role check, for routes that act on
/// the caller itself.
pub type SelfCheck<Req> = fn(&Authenticated, &Req) -> bool;

/// For routes that take no input.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmptyRequest {}

impl Validate for EmptyRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

pub struct Route<Req, Res> {
    method: Method,
    path: &'static str,
    auth: AuthMode,
    organization_required: bool,
    version_required: bool,
    blocking: bool,
    requirement: Option<Requirement>,
    self_check: Option<SelfCheck<Req>>,
    migrations: Migrations,
    handler: Handler<Req, Res>,
}

impl<Req, Res> Route<Req, Res>
where
    Req: DeserializeOwned + Validate + Send + 'static,
    Res: Serialize + Send + 'static,
{
    fn new<F, Fut>(method: Method, path: &'static str, handler: F) -> Self
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, AppError>> + Send + 'static,
    {
        Self {
            method,
            path,
            auth: AuthMode::Required,
            organization_required: true,
            version_required: true,
            blocking: false,
            requirement: None,
            self_check: None,
            migrations: Migrations::default(),
            handler: Arc::new(move |ctx, req| handler(ctx, req).boxed()),
        }
    }

    pub fn get<F, Fut>(path: &'static str, handler: F) -> Self
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, AppError>> + Send + 'static,
    {
        Self::new(Method::GET, path, handler)
    }

    pub fn post<F, Fut>(path: &'static str, handler: F) -> Self
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, AppError>> + Send + 'static,
    {
        Self::new(Method::POST, path, handler)
    }

    pub fn put<F, Fut>(path: &'static str, handler: F) -> Self
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, AppError>> + Send + 'static,
    {
        Self::new(Method::PUT, path, handler)
    }

    pub fn patch<F, Fut>(path: &'static str, handler: F) -> Self
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, AppError>> + Send + 'static,
    {
        Self::new(Method::PATCH, path, handler)
    }

    pub fn delete<F, Fut>(path: &'static str, handler: F) -> Self
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, AppError>> + Send + 'static,
    {
        Self::new(Method::DELETE, path, handler)
    }

    /// Skips authentication; the organization still comes from the host.
    pub fn public(mut self) -> Self {
        self.auth = AuthMode::Public;
        self
    }

    /// Also serves requests whose host matches no organization.
    pub fn without_organization(mut self) -> Self {
        self.organization_required = false;
        self
    }

    /// Serves clients that send no `Infra-Version`.
    pub fn unversioned(mut self) -> Self {
        self.version_required = false;
        self
    }

    /// Long polls get the longer blocking timeout.
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    pub fn requires(mut self, requirement: Requirement) -> Self {
        self.requirement = Some(requirement);
        self
    }

    pub fn allow_self(mut self, check: SelfCheck<Req>) -> Self {
        self.self_check = Some(check);
        self
    }

    pub fn migrate(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    fn method_filter(&self) -> MethodFilter {
        match self.method {
            Method::POST => MethodFilter::POST,
            Method::PUT => MethodFilter::PUT,
            Method::PATCH => MethodFilter::PATCH,
            Method::DELETE => MethodFilter::DELETE,
            _ => MethodFilter::GET,
        }
    }

    fn default_status(&self) -> StatusCode {
        match self.method {
            Method::POST => StatusCode::CREATED,
            Method::DELETE => StatusCode::NO_CONTENT,
            _ => StatusCode::OK,
        }
    }

    async fn serve(self: Arc<Self>, state: AppState, params: HashMap<String, String>, request: Request) -> Response {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        match self.run(state, params, request).await {
            Ok(response) => {
                tracing::debug!(%method, path, status = response.status().as_u16(), "API request");
                response
            }
            Err(err) => {
                let status = err.status_code().as_u16();
                match &err {
                    AppError::Unauthorized(detail) => {
                        tracing::info!(%method, path, status, detail = %detail, "API request unauthorized")
                    }
                    e if e.is_internal() => {}
                    e => tracing::debug!(%method, path, status, error = %e, "API request failed"),
                }
                err.into_response()
            }
        }
    }

    async fn run(&self, state: AppState, params: HashMap<String, String>, request: Request) -> Result<Response, AppError> {
        let (parts, body) = request.into_parts();
        let client = ClientVersion::from_header(
            parts.headers.get(version::HEADER).and_then(|v| v.to_str().ok()),
            self.version_required,
        )?;

        let body = to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| AppError::bad_request(format!("failed to read request body: {}", e)))?;
        let fields = binding::raw_fields(&parts.method, params, parts.uri.query(), &body)?;
        let fields = self.migrations.upgrade_request(&client, Value::Object(fields));
        let req: Req = binding::bind(fields)?;

        let mut tx = state.store.begin(TxOptions::read_write()).await?;
        let jar = CookieJar::from_headers(&parts.headers);
        let info = RequestInfo {
            method: &parts.method,
            path: parts.uri.path(),
            headers: &parts.headers,
            jar: &jar,
        };
        let admitted = async {
            let (auth, cookies) = authenticate(&state, tx.as_mut(), &info, self.auth).await?;
            if self.organization_required && auth.organization.is_none() {
                return Err(AppError::bad_request("organization is required"));
            }
            if let Some(requirement) = &self.requirement {
                let user = auth
                    .user
                    .as_ref()
                    .ok_or_else(|| AppError::unauthorized("route requires a user"))?;
                let is_self = self.self_check.is_some_and(|check| check(&auth, &req));
                if !is_self {
                    authorize::require_infra_role(tx.as_mut(), user.id, requirement).await?;
                }
            }
            Ok((auth, cookies))
        }
        .await;
        let (auth, cookies) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                return Err(e);
            }
        };

        let ctx = RequestContext::new(state.clone(), auth, tx);
        for cookie in cookies {
            ctx.add_cookie(cookie);
        }

        let timeout = if self.blocking {
            state.config.api.blocking_request_timeout
        } else {
            state.config.api.request_timeout
        };
        let outcome = match tokio::time::timeout(timeout, (self.handler)(ctx.clone(), req)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::GatewayTimeout),
        };
        let res = match outcome {
            Ok(res) => {
                ctx.commit().await?;
                res
            }
            Err(e) => {
                ctx.rollback().await;
                return Err(e);
            }
        };

        let value = serde_json::to_value(&res).map_err(|e| AppError::InternalError(e.into()))?;
        let value = self.migrations.downgrade_response(&client, value);

        let meta = ctx.take_response_meta();
        let status = meta.status.unwrap_or_else(|| self.default_status());
        let mut response = if status == StatusCode::NO_CONTENT || value.is_null() {
            let mut empty = Response::new(Body::empty());
            *empty.status_mut() = status;
            empty
        } else {
            (status, Json(value)).into_response()
        };
        response.headers_mut().extend(meta.headers);
        for cookie in meta.cookies {
            match HeaderValue::from_str(&cookie.to_string()) {
                Ok(v) => {
                    response.headers_mut().append(header::SET_COOKIE, v);
                }
                Err(_) => tracing::warn!(cookie = cookie.name(), "Dropping unencodable cookie"),
            }
        }
        Ok(response)
    }
}

/// Route table grouped by path, turned into an axum router.
#[derive(Default)]
pub struct Routes {
    by_path: BTreeMap<&'static str, MethodRouter<AppState>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<Req, Res>(&mut self, route: Route<Req, Res>) -> &mut Self
    where
        Req: DeserializeOwned + Validate + Send + Sync + 'static,
        Res: Serialize + Send + 'static,
    {
        let path = route.path;
        let filter = route.method_filter();
        let route = Arc::new(route);
        let handler = move |State(state): State<AppState>, params: Option<Path<HashMap<String, String>>>, request: Request| {
            let route = Arc::clone(&route);
            async move {
                let params = params.map(|Path(p)| p).unwrap_or_default();
                route.serve(state, params, request).await
            }
        };
        let methods = self.by_path.remove(path).unwrap_or_default();
        self.by_path.insert(path, methods.on(filter, handler));
        self
    }

    pub fn into_router(self) -> Router<AppState> {
        self.by_path
            .into_iter()
            .fold(Router::new(), |router, (path, methods)| router.route(path, methods))
    }
}
