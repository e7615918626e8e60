//! The HTTP gateway client against an in-process axum server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use inbox_pilot::config::GatewayConfig;
use inbox_pilot::error::{AnalysisError, ProviderError};
use inbox_pilot::mail::{
    AnalysisService, Category, HttpGateway, MailProvider, Priority, TaskRecord, TaskSink,
};

#[derive(Default)]
struct Recorded {
    requests: Mutex<Vec<(String, Value)>>,
    auth: Mutex<Vec<String>>,
}

type Shared = Arc<Recorded>;

fn record(state: &Shared, headers: &HeaderMap, route: String, body: Value) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.auth.lock().unwrap().push(auth);
    state.requests.lock().unwrap().push((route, body));
}

async fn unread(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(user): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let limit = query.get("limit").cloned().unwrap_or_default();
    record(&state, &headers, format!("unread:{user}:{limit}"), Value::Null);
    Json(json!([{
        "id": "m1",
        "sender": "alice@example.com",
        "subject": "Hello",
        "body": "Hi there",
        "received_at": "2026-03-02T09:00:00Z"
    }]))
}

async fn send(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(user): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    record(&state, &headers, format!("send:{user}"), body);
    StatusCode::OK
}

async fn label(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((user, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    record(&state, &headers, format!("label:{user}:{id}"), body);
    match id.as_str() {
        "busy" => StatusCode::SERVICE_UNAVAILABLE,
        "throttled" => StatusCode::TOO_MANY_REQUESTS,
        "gone" => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    }
}

async fn mark_read(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((user, id)): Path<(String, String)>,
) -> StatusCode {
    record(&state, &headers, format!("read:{user}:{id}"), Value::Null);
    StatusCode::NO_CONTENT
}

async fn classify(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    record(&state, &headers, "classify".into(), body);
    Json(json!({ "category": "action_required", "priority": "high", "summary": "needs a reply" }))
}

async fn draft(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    record(&state, &headers, "draft".into(), body.clone());
    if body["tone"] == "broken" {
        return (StatusCode::OK, Json(json!({ "unexpected": true })));
    }
    (StatusCode::OK, Json(json!({ "body": "Thanks, noted." })))
}

async fn create_task(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(user): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    record(&state, &headers, format!("task:{user}"), body);
    Json(json!({ "id": "task-9" }))
}

async fn start_server() -> (HttpGateway, Shared) {
    let state: Shared = Arc::new(Recorded::default());
    let app = Router::new()
        .route("/api/users/{user}/messages/unread", get(unread))
        .route("/api/users/{user}/messages/send", post(send))
        .route("/api/users/{user}/messages/{id}/labels", post(label))
        .route("/api/users/{user}/messages/{id}/read", post(mark_read))
        .route("/api/analysis/classify", post(classify))
        .route("/api/analysis/draft", post(draft))
        .route("/api/users/{user}/tasks", post(create_task))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let gateway = HttpGateway::new(&GatewayConfig {
        base_url: format!("http://127.0.0.1:{port}/api"),
        api_token: SecretString::from("test-token"),
        timeout: Duration::from_secs(5),
    })
    .unwrap();
    (gateway, state)
}

#[tokio::test]
async fn fetch_unread_decodes_emails_and_sends_token() {
    let (gateway, state) = start_server().await;
    let emails = gateway.fetch_unread("u1", 25).await.unwrap();

    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].id, "m1");
    assert!(!emails[0].is_read);
    assert_eq!(state.requests.lock().unwrap()[0].0, "unread:u1:25");
    assert_eq!(state.auth.lock().unwrap()[0], "Bearer test-token");
}

#[tokio::test]
async fn send_and_mark_read_post_to_user_paths() {
    let (gateway, state) = start_server().await;
    gateway
        .send("u1", "bob@example.com", "Re: Hello", "Hi Bob")
        .await
        .unwrap();
    gateway.mark_read("u1", "m1").await.unwrap();

    let requests = state.requests.lock().unwrap();
    assert_eq!(requests[0].0, "send:u1");
    assert_eq!(requests[0].1["to"], "bob@example.com");
    assert_eq!(requests[0].1["body"], "Hi Bob");
    assert_eq!(requests[1].0, "read:u1:m1");
}

#[tokio::test]
async fn server_errors_and_throttling_are_transient() {
    let (gateway, _state) = start_server().await;

    let err = gateway.label("u1", "busy", "Work").await.unwrap_err();
    assert!(matches!(err, ProviderError::Transient { .. }));
    assert!(err.is_retryable());

    let err = gateway.label("u1", "throttled", "Work").await.unwrap_err();
    assert!(err.is_retryable());

    let err = gateway.label("u1", "gone", "Work").await.unwrap_err();
    assert!(matches!(err, ProviderError::Permanent { .. }));
    assert!(!err.is_retryable());

    gateway.label("u1", "m1", "Work").await.unwrap();
}

#[tokio::test]
async fn classify_and_draft_round_trip() {
    let (gateway, state) = start_server().await;
    let email = gateway.fetch_unread("u1", 1).await.unwrap().remove(0);

    let classification = gateway.classify(&email).await.unwrap();
    assert_eq!(classification.category, Category::ActionRequired);
    assert_eq!(classification.priority, Priority::High);

    let body = gateway.draft(&email, "Acknowledge", "casual").await.unwrap();
    assert_eq!(body, "Thanks, noted.");

    let requests = state.requests.lock().unwrap();
    let draft_request = &requests.iter().find(|(route, _)| route == "draft").unwrap().1;
    assert_eq!(draft_request["instructions"], "Acknowledge");
    assert_eq!(draft_request["email"]["id"], "m1");
}

#[tokio::test]
async fn malformed_draft_response_is_invalid() {
    let (gateway, _state) = start_server().await;
    let email = gateway.fetch_unread("u1", 1).await.unwrap().remove(0);
    let err = gateway.draft(&email, "Acknowledge", "broken").await.unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidResponse { .. }));
}

#[tokio::test]
async fn create_task_returns_remote_id() {
    let (gateway, state) = start_server().await;
    let task = TaskRecord {
        title: "Pay invoice".into(),
        notes: "From alice".into(),
        due: NaiveDate::from_ymd_opt(2026, 3, 5).unwrap(),
        source_email_id: Some("m1".into()),
    };
    let id = gateway.create_task("u1", &task).await.unwrap();
    assert_eq!(id, "task-9");
    let requests = state.requests.lock().unwrap();
    assert_eq!(requests[0].0, "task:u1");
    assert_eq!(requests[0].1["title"], "Pay invoice");
}

#[tokio::test]
async fn unreachable_gateway_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let gateway = HttpGateway::new(&GatewayConfig {
        base_url: format!("http://127.0.0.1:{port}"),
        api_token: SecretString::from("t"),
        timeout: Duration::from_secs(2),
    })
    .unwrap();
    let err = gateway.fetch_unread("u1", 5).await.unwrap_err();
    assert!(err.is_retryable());
}
