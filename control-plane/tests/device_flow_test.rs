mod common;

use axum::http::{Method, StatusCode};
use common::{ApiCall, TestApp, TestResponse};
use serde_json::json;

async fn start(app: &TestApp) -> TestResponse {
    app.call(ApiCall::new(Method::POST, "/api/device").json(json!({})))
        .await
}

async fn poll(app: &TestApp, device_code: &str) -> TestResponse {
    app.call(
        ApiCall::new(Method::POST, "/api/device/status").json(json!({"deviceCode": device_code})),
    )
    .await
}

#[tokio::test]
async fn approved_device_receives_its_key_once() {
    let app = TestApp::spawn().await;
    let admin = app.admin_key("admin@example.com").await;

    let started = start(&app).await;
    assert_eq!(started.status, StatusCode::CREATED);
    let device_code = started.body["deviceCode"].as_str().unwrap().to_string();
    let user_code = started.body["userCode"].as_str().unwrap().to_string();
    assert!(started.body["verificationURI"].as_str().unwrap().contains("localhost"));
    assert!(started.body["pollIntervalSeconds"].as_i64().unwrap() > 0);

    let pending = poll(&app, &device_code).await;
    assert_eq!(pending.status, StatusCode::OK);
    assert_eq!(pending.body["status"], "pending");
    assert!(pending.body.get("loginResponse").is_none());

    let hurried = poll(&app, &device_code).await;
    assert_eq!(hurried.body["status"], "slow_down");

    let approved = app
        .post("/api/device/approve", &admin, json!({"userCode": user_code}))
        .await;
    assert!(approved.status.is_success(), "{}", approved.body);

    let confirmed = poll(&app, &device_code).await;
    assert_eq!(confirmed.body["status"], "confirmed");
    let login = &confirmed.body["loginResponse"];
    assert_eq!(login["name"], "admin@example.com");
    let device_key = login["accessKey"].as_str().unwrap().to_string();
    assert!(!device_key.is_empty());

    let me = app.get("/api/users/self", &device_key).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["name"], "admin@example.com");

    let again = poll(&app, &device_code).await;
    assert_eq!(again.body["status"], "confirmed");
    assert_eq!(again.body["loginResponse"]["accessKey"], "");
}

#[tokio::test]
async fn plain_access_keys_cannot_approve_devices() {
    let app = TestApp::spawn().await;
    let org = app.default_org().clone();
    let admin = app.seed_user(&org, "admin@example.com", common::PASSWORD, true).await;
    let session = common::session_key(&app.login("admin@example.com", common::PASSWORD).await);

    let created = app
        .post(
            "/api/access-keys",
            &session,
            json!({"userID": admin.id.to_string(), "name": "automation"}),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED);
    let plain = created.body["accessKey"].as_str().unwrap().to_string();

    let started = start(&app).await;
    let user_code = started.body["userCode"].as_str().unwrap().to_string();

    let response = app
        .post("/api/device/approve", &plain, json!({"userCode": user_code}))
        .await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_device_code_is_not_found() {
    let app = TestApp::spawn().await;

    let response = poll(&app, "no-such-device-code").await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn later_approvers_do_not_take_over_the_device() {
    let app = TestApp::spawn().await;
    let admin = app.admin_key("admin@example.com").await;
    let admin_id = app.get("/api/users/self", &admin).await.body["id"].clone();
    let (_, second) = app.user_key("second@example.com").await;
    let (_, third) = app.user_key("third@example.com").await;

    let started = start(&app).await;
    let device_code = started.body["deviceCode"].as_str().unwrap().to_string();
    let user_code = started.body["userCode"].as_str().unwrap().to_string();

    for key in [&admin, &second] {
        let approved = app
            .post("/api/device/approve", key, json!({"userCode": user_code}))
            .await;
        assert!(approved.status.is_success(), "{}", approved.body);
    }

    let confirmed = poll(&app, &device_code).await;
    assert_eq!(confirmed.body["status"], "confirmed");
    assert_eq!(confirmed.body["loginResponse"]["userID"], admin_id);

    let late = app
        .post("/api/device/approve", &third, json!({"userCode": user_code}))
        .await;
    assert!(late.status.is_success(), "{}", late.body);

    let again = poll(&app, &device_code).await;
    assert_eq!(again.body["loginResponse"]["userID"], admin_id);
    assert_eq!(again.body["loginResponse"]["name"], "admin@example.com");
}

#[tokio::test]
async fn polls_naming_another_client_are_not_found() {
    let app = TestApp::spawn().await;

    let started = app
        .call(ApiCall::new(Method::POST, "/api/device").json(json!({"clientID": "infra-cli"})))
        .await;
    assert_eq!(started.status, StatusCode::CREATED);
    let device_code = started.body["deviceCode"].as_str().unwrap();

    let foreign = app
        .call(
            ApiCall::new(Method::POST, "/api/device/status")
                .json(json!({"deviceCode": device_code, "clientID": "someone-else"})),
        )
        .await;
    assert_eq!(foreign.status, StatusCode::NOT_FOUND);

    let own = app
        .call(
            ApiCall::new(Method::POST, "/api/device/status")
                .json(json!({"deviceCode": device_code, "clientID": "infra-cli"})),
        )
        .await;
    assert_eq!(own.status, StatusCode::OK);
    assert_eq!(own.body["status"], "pending");
}
