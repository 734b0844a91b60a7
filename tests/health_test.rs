mod common;

use axum::http::{Method, StatusCode};
use common::{read_json, TestApp};

#[tokio::test]
async fn health_reports_database_and_cache() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/health", None, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["checks"]["database"], "healthy");
    assert_eq!(body["data"]["checks"]["cache"], "healthy");
}

#[tokio::test]
async fn status_names_the_service() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/status", None, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["data"]["service"], "clothing-store-api");
    assert_eq!(body["data"]["environment"], "test");
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = TestApp::new().await;

    let response = app
        .request(Method::GET, "/health", None, &[("x-request-id", "req-42")])
        .await;
    assert_eq!(
        response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-42")
    );
}
