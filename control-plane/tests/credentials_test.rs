//! Destination credential requests brokered between users and connectors.

mod common;

use axum::http::StatusCode;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use common::{test_config, TestApp, TestResponse};
use control_plane::models::Identity;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    app: Arc<TestApp>,
    connector: String,
    user: Identity,
    user_key: String,
}

/// A destination registered by its connector and a user who may or may not
/// hold a grant on it.
async fn fixture(broker_wait: Duration, grant: bool) -> Fixture {
    let mut config = test_config();
    config.api.broker_wait = broker_wait;
    config.api.blocking_request_timeout = broker_wait + Duration::from_secs(10);
    let app = Arc::new(TestApp::spawn_with(config, None).await);

    let admin = app.admin_key("admin@example.com").await;
    let connector = app.connector_key().await;

    let registered = app
        .post(
            "/api/destinations",
            &connector,
            json!({
                "name": "prod",
                "uniqueID": "prod-cluster",
                "kind": "kubernetes",
                "connection": {"url": "prod.example.com:443", "ca": "-----BEGIN CERTIFICATE-----"}
            }),
        )
        .await;
    assert_eq!(registered.status, StatusCode::CREATED, "{}", registered.body);
    assert_eq!(registered.body["connected"], true);
    assert_eq!(registered.body["connection"]["ca"], "-----BEGIN CERTIFICATE-----");

    let (user, user_key) = app.user_key("user@example.com").await;
    if grant {
        let granted = app
            .post(
                "/api/grants",
                &admin,
                json!({"user": user.id.to_string(), "privilege": "view", "resource": "prod"}),
            )
            .await;
        assert_eq!(granted.status, StatusCode::CREATED, "{}", granted.body);
    }

    Fixture {
        app,
        connector,
        user,
        user_key,
    }
}

async fn connector_poll(app: &TestApp, connector: &str, last_update_index: i64) -> TestResponse {
    app.get(
        &format!(
            "/api/credentials?destination=prod&lastUpdateIndex={}",
            last_update_index
        ),
        connector,
    )
    .await
}

#[tokio::test]
async fn connector_answers_a_waiting_user() {
    let f = fixture(Duration::from_secs(5), true).await;

    let app = f.app.clone();
    let user_key = f.user_key.clone();
    let waiting = tokio::spawn(async move {
        app.post("/api/credentials", &user_key, json!({"destination": "prod"}))
            .await
    });

    let mut pending: Option<Value> = None;
    for _ in 0..5 {
        let polled = connector_poll(&f.app, &f.connector, 0).await;
        assert_eq!(polled.status, StatusCode::OK, "{}", polled.body);
        if let Some(first) = polled.body["items"].as_array().and_then(|items| items.first()) {
            assert!(polled.header("last-update-index").is_some());
            pending = Some(first.clone());
            break;
        }
    }
    let pending = pending.expect("connector saw the request");
    assert_eq!(pending["userID"], f.user.id.to_string());
    assert_eq!(pending["answered"], false);

    let expires = (Utc::now() + ChronoDuration::minutes(10)).to_rfc3339_opts(SecondsFormat::Secs, true);
    let answered = f
        .app
        .put(
            "/api/credentials",
            &f.connector,
            json!({
                "id": pending["id"],
                "bearerToken": "short-lived-token",
                "credentialExpiresAt": expires
            }),
        )
        .await;
    assert_eq!(answered.status, StatusCode::OK, "{}", answered.body);

    let response = waiting.await.unwrap();
    assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
    assert_eq!(response.body["answered"], true);
    assert_eq!(response.body["bearerToken"], "short-lived-token");
    assert_eq!(response.body["credentialExpiresAt"], expires);
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let f = fixture(Duration::from_secs(1), true).await;

    let response = f
        .app
        .post("/api/credentials", &f.user_key, json!({"destination": "prod"}))
        .await;

    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn users_without_a_grant_cannot_request() {
    let f = fixture(Duration::from_secs(1), false).await;

    let response = f
        .app
        .post("/api/credentials", &f.user_key, json!({"destination": "prod"}))
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn idle_long_poll_returns_an_empty_list() {
    let f = fixture(Duration::from_secs(1), true).await;

    let polled = connector_poll(&f.app, &f.connector, 7).await;

    assert_eq!(polled.status, StatusCode::OK);
    assert_eq!(polled.body["items"], json!([]));
    assert!(polled.header("last-update-index").is_some());
}

#[tokio::test]
async fn users_cannot_poll_for_requests() {
    let f = fixture(Duration::from_secs(1), true).await;

    let polled = connector_poll(&f.app, &f.user_key, 0).await;

    assert_eq!(polled.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn connectors_poll_by_the_name_users_request() {
    let f = fixture(Duration::from_millis(50), true).await;

    let by_unique_id = f
        .app
        .get("/api/credentials?destination=prod-cluster&lastUpdateIndex=0", &f.connector)
        .await;
    assert_eq!(by_unique_id.status, StatusCode::NOT_FOUND, "{}", by_unique_id.body);

    let by_name = connector_poll(&f.app, &f.connector, 0).await;
    assert_eq!(by_name.status, StatusCode::OK, "{}", by_name.body);
}
