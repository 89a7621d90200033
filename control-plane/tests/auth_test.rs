//! Login, logout, one-time passwords, password reset and signup.

mod common;

use axum::http::{Method, StatusCode};
use common::{session_key, test_config, ApiCall, TestApp, PASSWORD};
use control_plane::services::email::{EmailKind, MockEmailService};
use serde_json::json;

#[tokio::test]
async fn password_login_starts_a_session() {
    let app = TestApp::spawn().await;
    let org = app.default_org().clone();
    app.seed_user(&org, "admin@example.com", PASSWORD, true).await;

    let response = app.login("admin@example.com", PASSWORD).await;

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["name"], "admin@example.com");
    assert_eq!(response.body["organizationName"], "Default");
    assert_eq!(response.body["passwordUpdateRequired"], false);
    assert!(response.header("set-cookie").is_some());

    let key = session_key(&response);
    let me = app.get("/api/users/self", &key).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["name"], "admin@example.com");
}

#[tokio::test]
async fn wrong_password_is_rejected_without_detail() {
    let app = TestApp::spawn().await;
    let org = app.default_org().clone();
    app.seed_user(&org, "admin@example.com", PASSWORD, true).await;

    let response = app.login("admin@example.com", "not-the-password1").await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body["code"], 401);
    assert_eq!(response.body["message"], "unauthorized");
}

#[tokio::test]
async fn requests_without_a_token_are_unauthorized() {
    let app = TestApp::spawn().await;

    let response = app.call(ApiCall::new(Method::GET, "/api/users")).await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn one_time_password_must_be_replaced_before_anything_else() {
    let app = TestApp::spawn().await;
    let admin = app.admin_key("admin@example.com").await;

    let created = app
        .post("/api/users", &admin, json!({"name": "bob@example.com"}))
        .await;
    assert_eq!(created.status, StatusCode::CREATED);
    let bob_id = created.body["id"].as_str().unwrap().to_string();
    let one_time = created.body["oneTimePassword"].as_str().unwrap().to_string();

    let login = app.login("bob@example.com", &one_time).await;
    assert_eq!(login.body["passwordUpdateRequired"], true);
    let bob = session_key(&login);

    // The restricted session only reaches the password change
    let blocked = app.get("/api/users/self", &bob).await;
    assert_eq!(blocked.status, StatusCode::UNAUTHORIZED);

    let changed = app
        .put(
            &format!("/api/users/{}", bob_id),
            &bob,
            json!({"oldPassword": one_time, "password": "newpassword1"}),
        )
        .await;
    assert_eq!(changed.status, StatusCode::OK, "{}", changed.body);
    assert_eq!(changed.body["name"], "bob@example.com");

    let me = app.get("/api/users/self", &bob).await;
    assert_eq!(me.status, StatusCode::OK);

    let relogin = app.login("bob@example.com", "newpassword1").await;
    assert_eq!(relogin.body["passwordUpdateRequired"], false);
}

#[tokio::test]
async fn weak_new_password_is_a_field_error() {
    let app = TestApp::spawn().await;
    let (user, key) = app.user_key("dana@example.com").await;

    let response = app
        .put(
            &format!("/api/users/{}", user.id),
            &key,
            json!({"oldPassword": PASSWORD, "password": "short"}),
        )
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["fieldErrors"][0]["fieldName"], "password");
}

#[tokio::test]
async fn logout_revokes_the_session_key() {
    let app = TestApp::spawn().await;
    let key = app.admin_key("admin@example.com").await;

    let response = app.post("/api/logout", &key, json!({})).await;
    assert_eq!(response.status, StatusCode::OK);

    let after = app.get("/api/users/self", &key).await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn access_key_login_exchanges_a_session_key() {
    let app = TestApp::spawn().await;
    let key = app.admin_key("admin@example.com").await;

    let response = app
        .call(
            ApiCall::new(Method::POST, "/api/login").json(json!({"accessKey": key})),
        )
        .await;

    assert_eq!(response.status, StatusCode::CREATED);
    assert_ne!(response.body["accessKey"].as_str().unwrap(), key);
}

#[tokio::test]
async fn password_reset_by_email_sets_a_new_password() {
    let app = TestApp::spawn_with_email().await;
    let org = app.default_org().clone();
    app.seed_user(&org, "carol@example.com", PASSWORD, false).await;
    let mail = app.mail.clone().unwrap();

    let requested = app
        .call(
            ApiCall::new(Method::POST, "/api/password-reset-request")
                .json(json!({"email": "carol@example.com"})),
        )
        .await;
    assert!(requested.status.is_success());

    let sent = mail.last_to("carol@example.com").expect("reset email was sent");
    assert_eq!(sent.kind, EmailKind::PasswordReset);
    let token = sent.link.split("token=").nth(1).unwrap().to_string();

    let reset = app
        .call(
            ApiCall::new(Method::POST, "/api/password-reset")
                .json(json!({"token": token, "password": "brandnew123"})),
        )
        .await;
    assert_eq!(reset.status, StatusCode::CREATED, "{}", reset.body);
    assert!(reset.body["accessKey"].is_string());

    assert_eq!(app.login("carol@example.com", "brandnew123").await.status, StatusCode::CREATED);

    let reused = app
        .call(
            ApiCall::new(Method::POST, "/api/password-reset")
                .json(json!({"token": token, "password": "another123"})),
        )
        .await;
    assert_eq!(reused.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn password_reset_for_unknown_address_looks_the_same() {
    let app = TestApp::spawn_with_email().await;
    let mail = app.mail.clone().unwrap();

    let response = app
        .call(
            ApiCall::new(Method::POST, "/api/password-reset-request")
                .json(json!({"email": "nobody@example.com"})),
        )
        .await;

    assert!(response.status.is_success());
    assert!(mail.sent().is_empty());
}

#[tokio::test]
async fn signup_is_rejected_when_disabled() {
    let app = TestApp::spawn().await;

    let response = app
        .call(ApiCall::new(Method::POST, "/api/signup").json(json!({
            "user": {"username": "founder@acme.io", "password": PASSWORD},
            "org": {"name": "Acme", "subDomain": "acme"}
        })))
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn signup_creates_an_organization_on_its_own_domain() {
    let mut config = test_config();
    config.signup.enabled = true;
    config.signup.base_domain = "example.com".to_string();
    let mail = MockEmailService::new();
    let app = TestApp::spawn_with(config, Some(mail.clone())).await;

    let signup = |sub: &'static str| {
        ApiCall::new(Method::POST, "/api/signup")
            .host("example.com")
            .json(json!({
                "user": {"username": "founder@acme.io", "password": PASSWORD},
                "org": {"name": "Acme", "subDomain": sub}
            }))
    };

    let response = app.call(signup("acme")).await;
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    assert_eq!(response.body["domain"], "acme.example.com");
    assert!(response.header("set-cookie").is_some());

    let verification = mail.last_to("founder@acme.io").expect("verification email was sent");
    assert_eq!(verification.kind, EmailKind::Verification);

    let login = app.login_on("acme.example.com", "founder@acme.io", PASSWORD).await;
    assert_eq!(login.status, StatusCode::CREATED);
    assert_eq!(login.body["organizationName"], "Acme");

    let taken = app.call(signup("acme")).await;
    assert_eq!(taken.status, StatusCode::CONFLICT);
}
