#![cfg(unix)]

mod support;

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use certpress::infra::{
    http::{HttpState, USER_ID_HEADER, build_router},
    memory::MemoryStore,
};
use http_body_util::BodyExt;
use serde_json::Value;
use support::{PRINTING_ENGINE, STALLING_ENGINE, TEMPLATE, Workspace, engine_config, service};
use tower::ServiceExt;

fn app(workspace: &Workspace, engine_body: &str, deadline: Duration) -> Router {
    let engine = workspace.engine("api", engine_body);
    let certificates = service(
        workspace,
        engine_config(engine, deadline),
        Arc::new(MemoryStore::allow_all()),
        workspace.write_template(TEMPLATE),
        workspace.write_asset(),
    );
    build_router(HttpState {
        certificates: Arc::new(certificates),
    })
}

fn generate_request(user: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/certificate/generate")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

fn get_request(user: Option<&str>, uri: &str) -> Request<Body> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_ID_HEADER, user);
    }
    builder.body(Body::empty()).expect("request should build")
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

const VALID_BODY: &str =
    r#"{"name":"A. Sharma","course":"Direct Tax Fundamentals","date":"January 5, 2024"}"#;

#[tokio::test]
async fn requests_without_identity_are_unauthorized() {
    let workspace = Workspace::new();
    let app = app(&workspace, PRINTING_ENGINE, Duration::from_secs(5));

    let response = send(&app, generate_request(None, VALID_BODY)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "unauthorized");

    let response = send(&app, get_request(None, "/api/certificate/user/user-1")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_check_needs_no_identity() {
    let workspace = Workspace::new();
    let app = app(&workspace, PRINTING_ENGINE, Duration::from_secs(5));

    let response = send(&app, get_request(None, "/healthz")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn generate_list_and_download_round_trip() {
    let workspace = Workspace::new();
    let app = app(&workspace, PRINTING_ENGINE, Duration::from_secs(5));

    let response = send(&app, generate_request(Some("user-1"), VALID_BODY)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/pdf"
    );
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .expect("ascii disposition")
        .to_string();
    assert!(disposition.starts_with("attachment; filename=\"TEST-"));
    assert!(disposition.ends_with(".pdf\""));
    let generated = body_bytes(response).await;
    assert!(generated.starts_with(b"%PDF"));

    let response = send(&app, get_request(Some("user-1"), "/api/certificate/user/user-1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let listing = body_json(response).await;
    assert_eq!(listing["success"], true);
    let certificates = listing["certificates"].as_array().expect("array");
    assert_eq!(certificates.len(), 1);
    let number = certificates[0]["certificateNumber"]
        .as_str()
        .expect("certificate number")
        .to_string();
    assert!(disposition.contains(&number));

    let download_uri = format!("/api/certificate/download/{number}");
    let response = send(&app, get_request(Some("user-2"), &download_uri)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, generated);

    std::fs::remove_file(workspace.artifacts_dir().join(format!("{number}.pdf")))
        .expect("artifact removed");
    let response = send(&app, get_request(Some("user-1"), &download_uri)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["code"], "artifact_not_found");
}

#[tokio::test]
async fn listing_other_users_is_forbidden() {
    let workspace = Workspace::new();
    let app = app(&workspace, PRINTING_ENGINE, Duration::from_secs(5));

    let response = send(&app, get_request(Some("user-2"), "/api/certificate/user/user-1")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["success"], false);
}

#[tokio::test]
async fn invalid_payloads_are_bad_requests() {
    let workspace = Workspace::new();
    let app = app(&workspace, PRINTING_ENGINE, Duration::from_secs(5));

    let response = send(
        &app,
        generate_request(Some("user-1"), r#"{"name":"   ","course":"Course"}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "validation_error");

    let response = send(&app, generate_request(Some("user-1"), "{not json")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], "validation_error");
}

#[tokio::test]
async fn unknown_certificates_are_not_found() {
    let workspace = Workspace::new();
    let app = app(&workspace, PRINTING_ENGINE, Duration::from_secs(5));

    let response = send(
        &app,
        get_request(Some("user-1"), "/api/certificate/download/TEST-1-ABCDEFGHIJ"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["code"], "not_found");
}

#[tokio::test]
async fn render_timeout_asks_clients_to_retry() {
    let workspace = Workspace::new();
    let app = app(&workspace, STALLING_ENGINE, Duration::from_millis(400));

    let response = send(&app, generate_request(Some("user-1"), VALID_BODY)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    assert_eq!(body_json(response).await["error"]["code"], "render_timeout");
}
