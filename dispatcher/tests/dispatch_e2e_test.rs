//! End-to-end dispatcher runs against a mock provider.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use dispatcher::{
    DispatchError, Dispatcher, DispatcherConfig, GenerateError, MemoryDocument, SelectionOutcome,
    TextDocument,
};
use serde_json::{json, Value};
use shared_types::{InsertionMode, Position, TextRange};
use tokio::net::TcpListener;

const TEXT: &str = "alpha\nbeta\ngamma";

#[derive(Clone, Default)]
struct MockState {
    attempts: Arc<AtomicUsize>,
}

fn last_user_message(body: &Value) -> String {
    body["messages"]
        .as_array()
        .and_then(|messages| messages.last())
        .and_then(|message| message["content"].as_str())
        .unwrap_or_default()
        .to_string()
}

/// Streams the prompt back upper-cased, two chars per event.
async fn shout(Json(body): Json<Value>) -> Response {
    let chars: Vec<char> = last_user_message(&body).to_uppercase().chars().collect();
    let mut events: Vec<String> = chars
        .chunks(2)
        .map(|piece| {
            let piece: String = piece.iter().collect();
            format!(
                "data: {}\n\n",
                json!({"choices": [{"delta": {"content": piece}}]})
            )
        })
        .collect();
    events.push("data: [DONE]\n\n".to_string());

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(futures::stream::iter(
            events.into_iter().map(Ok::<_, std::io::Error>),
        )))
        .unwrap()
}

async fn silent() -> Json<Value> {
    Json(json!({"choices": [{"message": {"content": "  "}}]}))
}

async fn reject() -> Response {
    (StatusCode::BAD_REQUEST, "prompt rejected").into_response()
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(10)).await;
    "late"
}

async fn limited_once(State(state): State<MockState>) -> Response {
    if state.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [
                ("retry-after-ms", "10"),
                ("x-ratelimit-limit-requests", "30"),
            ],
            "slow down",
        )
            .into_response();
    }
    Json(json!({"choices": [{"message": {"content": "ok"}}]})).into_response()
}

async fn start_mock() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/shout", post(shout))
        .route("/silent", post(silent))
        .route("/reject", post(reject))
        .route("/slow", post(slow))
        .route("/limited", post(limited_once))
        .with_state(MockState::default());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });
    (addr, handle)
}

fn config(addr: SocketAddr, path: &str, mode: InsertionMode) -> DispatcherConfig {
    DispatcherConfig {
        base_url: format!("http://{addr}"),
        request_path: path.to_string(),
        insertion_mode: mode,
        max_concurrency: 4,
        max_per_minute: 6_000,
        refill_interval_ms: 20,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
        request_timeout_ms: 5_000,
        api_key_env: "DISPATCHER_E2E_UNSET_KEY".to_string(),
        ..Default::default()
    }
}

fn line(index: usize, len: usize) -> TextRange {
    TextRange::new(Position::new(index, 0), Position::new(index, len))
}

async fn run(
    config: &DispatcherConfig,
    selections: &[TextRange],
) -> (Vec<SelectionOutcome>, String) {
    let dispatcher = Dispatcher::new(config).await.unwrap();
    let document = Arc::new(MemoryDocument::new("e2e", TEXT));
    let outcomes = dispatcher
        .run(document.clone() as Arc<dyn TextDocument>, selections)
        .await;
    assert_eq!(dispatcher.registry().document_count().await, 0);
    dispatcher.shutdown().await;
    (outcomes, document.text().await)
}

#[tokio::test]
async fn test_append_mode_writes_after_each_selection() {
    let (addr, server) = start_mock().await;
    let (outcomes, text) = run(
        &config(addr, "/shout", InsertionMode::Append),
        &[line(0, 5), line(2, 5)],
    )
    .await;

    assert!(outcomes
        .iter()
        .all(|o| matches!(o, SelectionOutcome::Completed { chars: 5 })));
    assert_eq!(text, "alpha\nALPHA\nbeta\ngamma\nGAMMA");
    server.abort();
}

#[tokio::test]
async fn test_replace_mode_swaps_selections() {
    let (addr, server) = start_mock().await;
    let mut cfg = config(addr, "/shout", InsertionMode::Replace);
    cfg.pre_separator = None;
    let (outcomes, text) = run(&cfg, &[line(0, 5), line(1, 4), line(2, 5)]).await;

    assert!(outcomes.iter().all(SelectionOutcome::is_completed));
    assert_eq!(text, "ALPHA\nBETA\nGAMMA");
    server.abort();
}

#[tokio::test]
async fn test_failure_restores_original_text() {
    let (addr, server) = start_mock().await;
    let (outcomes, text) = run(
        &config(addr, "/reject", InsertionMode::Replace),
        &[line(0, 5), line(2, 5)],
    )
    .await;

    for outcome in &outcomes {
        match outcome {
            SelectionOutcome::Failed(DispatchError::Generate(GenerateError::HttpStatus {
                status,
                ..
            })) => assert_eq!(*status, 400),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(text, TEXT);
    server.abort();
}

#[tokio::test]
async fn test_blank_output_is_empty_and_leaves_document_unchanged() {
    let (addr, server) = start_mock().await;
    let (outcomes, text) = run(
        &config(addr, "/silent", InsertionMode::Append),
        &[line(1, 4)],
    )
    .await;

    assert!(matches!(outcomes[0], SelectionOutcome::Empty));
    assert_eq!(text, TEXT);
    server.abort();
}

#[tokio::test]
async fn test_cancel_stops_running_and_queued_selections() {
    let (addr, server) = start_mock().await;
    let mut cfg = config(addr, "/slow", InsertionMode::Append);
    cfg.max_concurrency = 1;
    let dispatcher = Arc::new(Dispatcher::new(&cfg).await.unwrap());
    let document: Arc<dyn TextDocument> = Arc::new(MemoryDocument::new("cancel", TEXT));

    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .run(document, &[line(0, 5), line(1, 4), line(2, 5)])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    dispatcher.cancel().await;

    let outcomes = tokio::time::timeout(Duration::from_secs(3), runner)
        .await
        .expect("run did not stop after cancel")
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, SelectionOutcome::Canceled)));
    dispatcher.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn test_rate_hint_reaches_scheduler() {
    let (addr, server) = start_mock().await;
    let cfg = config(addr, "/limited", InsertionMode::Append);
    let dispatcher = Dispatcher::new(&cfg).await.unwrap();
    let document: Arc<dyn TextDocument> = Arc::new(MemoryDocument::new("hint", TEXT));

    let outcomes = dispatcher.run(document.clone(), &[line(0, 5)]).await;

    assert!(outcomes[0].is_completed());
    assert_eq!(document.text().await, "alpha\nok\nbeta\ngamma");
    let snapshot = dispatcher.scheduler().snapshot().await.unwrap();
    assert_eq!(snapshot.max_per_minute, 30);
    dispatcher.shutdown().await;
    server.abort();
}
