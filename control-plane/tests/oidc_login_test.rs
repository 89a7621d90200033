//! OIDC login against a mocked identity provider.

mod common;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::{ApiCall, TestApp, TestResponse};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLIENT_ID: &str = "infra-client";
const CLIENT_SECRET: &str = "provider-client-secret";

const SIGNING_KEY_ID: &str = "provider-key-1";
const SIGNING_KEY_PEM: &str = include_str!("fixtures/provider_signing_key.pem");
const SIGNING_KEY_MODULUS: &str = "v8YzzaL5Ebg7EzyO5W_TRfRFzY5dwkQsyUmOeArg83mEG7CSQF-K6IgRo55xSbgDrORlfNXhEDXRXtcTM34K9DNZTNNnRhDBF1u-GyTdkNo5CsSQzDrPMOVdOjKDNdY3YyfAVqSbv3LlPixdM73GzF3KG8BwOVeDEOlmPH9vXVr4vhz-cCWNAd7nX4qiIJ-0F5FV0HTuIVu5B1DCyoNBh-1HFr04I3RX_ctrIRmwpyRzlzXalBE3zQD5VsMIdyFUQE3l7Wk73tuceok98jag5D6ckGeP3yhcoVbBdFWJsSiGk2K0PVBQV2Zcy8nSnjgvVfw8RY_BkyaIAwfqsJSfkw";

fn claims(issuer: &str, email: &str) -> Value {
    json!({
        "iss": issuer,
        "aud": CLIENT_ID,
        "sub": "00u1provider",
        "email": email,
        "iat": Utc::now().timestamp(),
        "exp": Utc::now().timestamp() + 3600,
    })
}

fn id_token(issuer: &str, email: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(SIGNING_KEY_ID.to_string());
    let key = EncodingKey::from_rsa_pem(SIGNING_KEY_PEM.as_bytes()).unwrap();
    encode(&header, &claims(issuer, email), &key).unwrap()
}

/// Signed with the client secret, which the provider also knows.
fn secret_signed_id_token(issuer: &str, email: &str) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(SIGNING_KEY_ID.to_string());
    encode(
        &header,
        &claims(issuer, email),
        &EncodingKey::from_secret(CLIENT_SECRET.as_bytes()),
    )
    .unwrap()
}

struct ProviderBehavior {
    id_token: fn(&str, &str) -> String,
    expires_in: i64,
}

impl Default for ProviderBehavior {
    fn default() -> Self {
        Self {
            id_token,
            expires_in: 3600,
        }
    }
}

/// Serves discovery, JWKS, the token endpoint (for code `good-code`) and
/// userinfo. Every other token request, refreshes included, is refused.
async fn identity_provider(email: &str, groups: Value) -> MockServer {
    identity_provider_with(email, groups, ProviderBehavior::default()).await
}

async fn identity_provider_with(email: &str, groups: Value, behavior: ProviderBehavior) -> MockServer {
    let server = MockServer::start().await;
    let issuer = server.uri();

    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{}/authorize", issuer),
            "token_endpoint": format!("{}/token", issuer),
            "userinfo_endpoint": format!("{}/userinfo", issuer),
            "jwks_uri": format!("{}/keys", issuer),
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": [{
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": SIGNING_KEY_ID,
                "n": SIGNING_KEY_MODULUS,
                "e": "AQAB",
            }]
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=good-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "provider-access-token",
            "refresh_token": "provider-refresh-token",
            "id_token": (behavior.id_token)(&issuer, email),
            "expires_in": behavior.expires_in,
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "email": email,
            "name": "Provider User",
            "groups": groups,
        })))
        .mount(&server)
        .await;

    server
}

async fn create_provider(app: &TestApp, admin: &str, url: &str, allowed_domains: Value) -> String {
    let response = app
        .post(
            "/api/providers",
            admin,
            json!({
                "name": "corp-sso",
                "url": url,
                "clientID": CLIENT_ID,
                "clientSecret": CLIENT_SECRET,
                "allowedDomains": allowed_domains,
            }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    assert_eq!(response.body["kind"], "oidc");
    assert!(response.body.get("clientSecret").is_none());
    response.body["id"].as_str().unwrap().to_string()
}

async fn oidc_login(app: &TestApp, provider_id: &str, code: &str) -> TestResponse {
    app.call(ApiCall::new(Method::POST, "/api/login").json(json!({
        "oidc": {
            "providerID": provider_id,
            "redirectURL": "https://localhost/login/callback",
            "code": code,
        }
    })))
    .await
}

#[tokio::test]
async fn oidc_login_creates_the_user_and_their_groups() {
    let server = identity_provider("dev@example.com", json!(["developers"])).await;
    let app = TestApp::spawn().await;
    let admin = app.admin_key("admin@example.com").await;
    let provider_id = create_provider(&app, &admin, &server.uri(), json!([])).await;

    let login = oidc_login(&app, &provider_id, "good-code").await;

    assert_eq!(login.status, StatusCode::CREATED, "{}", login.body);
    assert_eq!(login.body["name"], "dev@example.com");
    assert_eq!(login.body["passwordUpdateRequired"], false);

    let groups = app.get("/api/groups?name=developers", &admin).await;
    assert_eq!(groups.status, StatusCode::OK);
    assert_eq!(groups.body["items"][0]["name"], "developers");

    let key = login.body["accessKey"].as_str().unwrap();
    let me = app.get("/api/users/self", key).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["verified"], true);
}

#[tokio::test]
async fn rejected_authorization_code_fails_login() {
    let server = identity_provider("dev@example.com", json!([])).await;
    let app = TestApp::spawn().await;
    let admin = app.admin_key("admin@example.com").await;
    let provider_id = create_provider(&app, &admin, &server.uri(), json!([])).await;

    let login = oidc_login(&app, &provider_id, "stale-code").await;

    assert_eq!(login.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn emails_outside_allowed_domains_are_refused() {
    let server = identity_provider("contractor@elsewhere.io", json!([])).await;
    let app = TestApp::spawn().await;
    let admin = app.admin_key("admin@example.com").await;
    let provider_id = create_provider(&app, &admin, &server.uri(), json!(["example.com"])).await;

    let login = oidc_login(&app, &provider_id, "good-code").await;

    assert_eq!(login.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn providers_are_listed_without_the_builtin_one() {
    let server = identity_provider("dev@example.com", json!([])).await;
    let app = TestApp::spawn().await;
    let admin = app.admin_key("admin@example.com").await;
    create_provider(&app, &admin, &server.uri(), json!([])).await;

    let listed = app
        .call(ApiCall::new(Method::GET, "/api/providers"))
        .await;

    assert_eq!(listed.status, StatusCode::OK);
    let names: Vec<&str> = listed.body["items"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["name"].as_str())
        .collect();
    assert_eq!(names, vec!["corp-sso"]);
}

#[tokio::test]
async fn id_tokens_signed_with_the_client_secret_are_refused() {
    let behavior = ProviderBehavior {
        id_token: secret_signed_id_token,
        ..Default::default()
    };
    let server = identity_provider_with("dev@example.com", json!([]), behavior).await;
    let app = TestApp::spawn().await;
    let admin = app.admin_key("admin@example.com").await;
    let provider_id = create_provider(&app, &admin, &server.uri(), json!([])).await;

    let login = oidc_login(&app, &provider_id, "good-code").await;

    assert_eq!(login.status, StatusCode::UNAUTHORIZED, "{}", login.body);
    let users = app.get("/api/users?name=dev@example.com", &admin).await;
    assert_eq!(users.body["items"], json!([]));
}

#[tokio::test]
async fn refused_refresh_revokes_the_users_keys() {
    // Inside the refresh window from the start, so the next exchange refreshes.
    let behavior = ProviderBehavior {
        expires_in: 60,
        ..Default::default()
    };
    let server = identity_provider_with("dev@example.com", json!([]), behavior).await;
    let app = TestApp::spawn().await;
    let admin = app.admin_key("admin@example.com").await;
    let provider_id = create_provider(&app, &admin, &server.uri(), json!([])).await;

    let login = oidc_login(&app, &provider_id, "good-code").await;
    assert_eq!(login.status, StatusCode::CREATED, "{}", login.body);
    let key = login.body["accessKey"].as_str().unwrap().to_string();

    let exchange = app
        .call(ApiCall::new(Method::POST, "/api/login").json(json!({"accessKey": key})))
        .await;
    assert_eq!(exchange.status, StatusCode::UNAUTHORIZED, "{}", exchange.body);

    let me = app.get("/api/users/self", &key).await;
    assert_eq!(me.status, StatusCode::UNAUTHORIZED);
}
