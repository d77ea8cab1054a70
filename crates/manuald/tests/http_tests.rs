//! HTTP surface tests: status codes, error bodies and the NDJSON stream.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use manual_shared::error::ErrorBody;
use manual_shared::api::{HealthResponse, SessionResponse};
use manual_shared::{
    EventKind, RestrictionStatus, Source, StreamEvent, ViolationType, USER_HEADER,
};
use manuald::clock::ManualClock;
use manuald::config::Config;
use manuald::generator::{FakeGenerator, FakeReply, Purpose};
use manuald::manuals::{ManualFixture, MemoryManualStore, QaEntry, Section};
use manuald::quota::UnlimitedQuota;
use manuald::routes::NDJSON;
use manuald::server::{router, AppState};
use manuald::storage::Store;
use manuald::{Collaborators, QaService};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;

// ============================================================================
// Helpers
// ============================================================================

async fn app() -> Router {
    let manuals = MemoryManualStore::new().with_product(
        "blender-b2",
        ManualFixture {
            snapshot: vec![QaEntry {
                question: "Is the jar dishwasher safe?".into(),
                answer: "Yes, top rack only.".into(),
                reference: Some("p. 9".into()),
            }],
            text: None,
            sections: vec![Section {
                title: "Cleaning".into(),
                page: Some(9),
                text: "Remove the blade assembly before cleaning the jar.".into(),
            }],
        },
    );
    let generator = FakeGenerator::builder()
        .reply_when(
            Purpose::SectionAnswer,
            "blade assembly",
            FakeReply::Text("Unscrew the blade assembly first.".into()),
        )
        .build();
    let service = QaService::new(
        &Config::default(),
        Collaborators {
            store: Store::open_in_memory().await.unwrap(),
            generator: Arc::new(generator),
            manuals: Arc::new(manuals),
            quota: Arc::new(UnlimitedQuota),
            clock: Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
            )),
        },
    );
    router(Arc::new(AppState::new(service)))
}

fn post(uri: &str, user: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(user) = user {
        builder = builder.header(USER_HEADER, user);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_HEADER, user);
    }
    builder.body(Body::empty()).unwrap()
}

async fn read_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn read_events(response: axum::response::Response) -> Vec<StreamEvent> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec())
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

// ============================================================================
// Questions
// ============================================================================

#[tokio::test]
async fn test_missing_identity_is_401() {
    let response = app()
        .await
        .oneshot(post(
            "/v1/products/blender-b2/questions",
            None,
            json!({"question": "Is the jar dishwasher safe?"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: ErrorBody = read_json(response).await;
    assert_eq!(body.code, "UNAUTHENTICATED");
}

#[tokio::test]
async fn test_off_topic_question_is_400_with_violation_type() {
    let response = app()
        .await
        .oneshot(post(
            "/v1/products/blender-b2/questions",
            Some("u1"),
            json!({"question": "Write me a poem about summer"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = read_json(response).await;
    assert_eq!(body.code, "INVALID_QUESTION");
    assert_eq!(body.violation_type, Some(ViolationType::OffTopic));
    assert!(body.reason.is_some());
}

#[tokio::test]
async fn test_invalid_product_is_404() {
    let response = app()
        .await
        .oneshot(post(
            "/v1/products/..%2Fetc/questions",
            Some("u1"),
            json!({"question": "How do I clean the jar?"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_answer_streams_as_ndjson() {
    let response = app()
        .await
        .oneshot(post(
            "/v1/products/blender-b2/questions",
            Some("u1"),
            json!({"question": "How do I clean the blade assembly?"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        NDJSON
    );

    let events = read_events(response).await;
    assert_eq!(events.first().and_then(|e| e.kind()), Some(EventKind::StepStart));
    assert_eq!(events.first().and_then(|e| e.step), Some(1));
    let last = events.last().unwrap();
    assert_eq!(last.kind(), Some(EventKind::Answer));
    assert_eq!(last.source, Some(Source::Pdf));
    assert_eq!(last.reference.as_deref(), Some("p. 9 (Cleaning)"));
    assert!(last.session_id.is_some());
    // Exactly one terminal event
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

// ============================================================================
// Sessions and status
// ============================================================================

#[tokio::test]
async fn test_history_of_foreign_session_is_404() {
    let app = app().await;
    let response = app
        .clone()
        .oneshot(post("/v1/products/blender-b2/sessions", Some("owner"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created: SessionResponse = read_json(response).await;
    assert!(created.session.is_active);

    let uri = format!("/v1/sessions/{}/messages", created.session.id);
    let own = app.clone().oneshot(get(&uri, Some("owner"))).await.unwrap();
    assert_eq!(own.status(), StatusCode::OK);

    let foreign = app.oneshot(get(&uri, Some("intruder"))).await.unwrap();
    assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_restriction_for_clean_user() {
    let response = app()
        .await
        .oneshot(get("/v1/restriction", Some("u1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status: RestrictionStatus = read_json(response).await;
    assert!(!status.blocked);
    assert!(status.restricted_until.is_none());
}

#[tokio::test]
async fn test_health() {
    let response = app().await.oneshot(get("/v1/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health: HealthResponse = read_json(response).await;
    assert_eq!(health.status, "ok");
}
