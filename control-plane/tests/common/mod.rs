//! Test helpers for control-plane integration tests.
//!
//! Every test gets its own in-memory store and drives the real router with
//! `oneshot`, so nothing here needs PostgreSQL or Redis.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use control_plane::{
    build_router,
    config::ServerConfig,
    data::{MemoryStore, Store, TxOptions},
    models::{
        grant::{RESOURCE_INFRA, ROLE_ADMIN},
        identity::CONNECTOR_IDENTITY_NAME,
        AccessKey, Grant, Identity, Organization, Subject,
    },
    services::{
        access_keys,
        broker::Broker,
        crypto::Sealer,
        email::{EmailProvider, MockEmailService, NoopEmailService},
        limiter::Limiter,
        oidc::OidcClient,
        organizations, users,
    },
    AppState,
};
use serde_json::{json, Value};
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

pub const HOST: &str = "localhost";
pub const API_VERSION: &str = "0.21.0";
pub const PASSWORD: &str = "password123";

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::for_tests();
    config.log_level = "error".to_string();
    config.api.broker_wait = Duration::from_secs(2);
    config.api.blocking_request_timeout = Duration::from_secs(10);
    config
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// One request against the router. Defaults to the default organization's
/// host and the current API version.
pub struct ApiCall {
    method: Method,
    uri: String,
    host: String,
    token: Option<String>,
    version: Option<String>,
    body: Option<Value>,
    headers: Vec<(String, String)>,
}

impl ApiCall {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            host: HOST.to_string(),
            token: None,
            version: Some(API_VERSION.to_string()),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn without_version(mut self) -> Self {
        self.version = None;
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn into_request(self) -> Request<Body> {
        let mut builder = Request::builder()
            .method(self.method)
            .uri(self.uri)
            .header(header::HOST, self.host);
        if let Some(version) = self.version {
            builder = builder.header("infra-version", version);
        }
        if let Some(token) = self.token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }
        match self.body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    /// Set when the app was spawned with email delivery.
    pub mail: Option<MockEmailService>,
}

impl TestApp {
    /// No email delivery, so new users get one-time passwords.
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config(), None).await
    }

    /// Records outgoing email instead of dropping it.
    pub async fn spawn_with_email() -> Self {
        Self::spawn_with(test_config(), Some(MockEmailService::new())).await
    }

    pub async fn spawn_with(config: ServerConfig, mail: Option<MockEmailService>) -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let default_org = if config.signup.enabled {
            None
        } else {
            Some(
                organizations::ensure_default(&store, &config.signup)
                    .await
                    .expect("Failed to create default organization"),
            )
        };

        let email: Arc<dyn EmailProvider> = match &mail {
            Some(mock) => Arc::new(mock.clone()),
            None => Arc::new(NoopEmailService),
        };

        let state = AppState {
            config: config.clone(),
            store,
            limiter: Arc::new(Limiter::in_memory(config.rate_limit.clone())),
            email,
            sealer: Arc::new(Sealer::ephemeral()),
            oidc: Arc::new(OidcClient::new(config.oidc.http_timeout).expect("Failed to build OIDC client")),
            broker: Arc::new(Broker::new()),
            default_org,
            signup_rate_limiter: create_ip_rate_limiter(config.rate_limit.signup_per_ip_per_hour, 3600),
        };
        let router = build_router(state.clone()).await.expect("Failed to build router");

        Self { router, state, mail }
    }

    pub fn default_org(&self) -> &Organization {
        self.state
            .default_org
            .as_ref()
            .expect("app was spawned without a default organization")
    }

    pub async fn call(&self, call: ApiCall) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(call.into_request())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        TestResponse { status, headers, body }
    }

    pub async fn get(&self, uri: &str, token: &str) -> TestResponse {
        self.call(ApiCall::new(Method::GET, uri).token(token)).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> TestResponse {
        self.call(ApiCall::new(Method::POST, uri).token(token).json(body)).await
    }

    pub async fn put(&self, uri: &str, token: &str, body: Value) -> TestResponse {
        self.call(ApiCall::new(Method::PUT, uri).token(token).json(body)).await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> TestResponse {
        self.call(ApiCall::new(Method::DELETE, uri).token(token)).await
    }

    /// Creates an organization directly in the store.
    pub async fn create_org(&self, name: &str, domain: &str) -> Organization {
        let mut tx = self.state.store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new(name, domain, Default::default());
        organizations::create(tx.as_mut(), &mut org).await.unwrap();
        tx.commit().await.unwrap();
        org
    }

    /// Creates a user with a permanent password, optionally an infra admin.
    pub async fn seed_user(&self, org: &Organization, name: &str, password: &str, admin: bool) -> Identity {
        let mut tx = self.state.store.begin(TxOptions::read_write()).await.unwrap();
        tx.set_organization_id(Some(org.id));
        let mut identity = Identity::new(name, Default::default());
        tx.create_identity(&mut identity).await.unwrap();
        users::set_password(tx.as_mut(), &identity, password, false, self.state.config.bcrypt_cost)
            .await
            .unwrap();
        if admin {
            let mut grant = Grant::new(Subject::User(identity.id), ROLE_ADMIN, RESOURCE_INFRA);
            tx.create_grant(&mut grant).await.unwrap();
        }
        tx.commit().await.unwrap();
        identity
    }

    pub async fn login_on(&self, host: &str, name: &str, password: &str) -> TestResponse {
        self.call(
            ApiCall::new(Method::POST, "/api/login")
                .host(host)
                .json(json!({"passwordCredentials": {"name": name, "password": password}})),
        )
        .await
    }

    pub async fn login(&self, name: &str, password: &str) -> TestResponse {
        self.login_on(HOST, name, password).await
    }

    /// Seeds an admin in the default organization and returns a session key.
    pub async fn admin_key(&self, name: &str) -> String {
        let org = self.default_org().clone();
        self.seed_user(&org, name, PASSWORD, true).await;
        session_key(&self.login(name, PASSWORD).await)
    }

    /// Seeds a user without grants in the default organization.
    pub async fn user_key(&self, name: &str) -> (Identity, String) {
        let org = self.default_org().clone();
        let identity = self.seed_user(&org, name, PASSWORD, false).await;
        let key = session_key(&self.login(name, PASSWORD).await);
        (identity, key)
    }

    /// An access key for the default organization's connector identity.
    pub async fn connector_key(&self) -> String {
        let org = self.default_org().clone();
        let mut tx = self.state.store.begin(TxOptions::read_write()).await.unwrap();
        tx.set_organization_id(Some(org.id));
        let connector = tx.get_identity_by_name(CONNECTOR_IDENTITY_NAME).await.unwrap();
        let infra = tx.get_infra_provider().await.unwrap();
        let mut key = AccessKey::new(connector.id, infra.id);
        key.name = "connector-test".to_string();
        key.expires_at = Utc::now() + ChronoDuration::hours(1);
        let issued = access_keys::issue(tx.as_mut(), key, self.state.config.bcrypt_cost)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        issued.bearer
    }
}

pub fn session_key(response: &TestResponse) -> String {
    assert_eq!(response.status, StatusCode::CREATED, "login failed: {}", response.body);
    response.body["accessKey"]
        .as_str()
        .expect("login response has an accessKey")
        .to_string()
}
