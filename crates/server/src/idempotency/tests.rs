//! Idempotency gate tests against the in-memory keyed store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{middleware, Json, Router};
use http_body_util::BodyExt;
use tower::ServiceExt;

use medpulse_kv::{KeyedStore, MemoryStore};

use super::{idempotency_middleware, IDEMPOTENCY_HEADER};

fn counting_router(store: Arc<dyn KeyedStore>, counter: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/order",
            post(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(serde_json::json!({ "execution": n, "order_id": format!("ord-{n}") }))
                }
            }),
        )
        .layer(middleware::from_fn_with_state(store, idempotency_middleware))
}

fn post_with_key(key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/order");
    if let Some(key) = key {
        builder = builder.header(IDEMPOTENCY_HEADER, key);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn replay_law_second_response_equals_first() {
    let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let app = counting_router(store, counter.clone());

    let first = app.clone().oneshot(post_with_key(Some("abc123"))).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_string(first).await;

    let second = app.clone().oneshot(post_with_key(Some("abc123"))).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_string(second).await;

    assert_eq!(first_body, second_body, "replay must be byte-for-byte");
    assert_eq!(counter.load(Ordering::SeqCst), 1, "handler executed once");
}

#[tokio::test]
async fn missing_header_bypasses_gate() {
    let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let app = counting_router(store, counter.clone());

    let first = app.clone().oneshot(post_with_key(None)).await.unwrap();
    let second = app.clone().oneshot(post_with_key(None)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(counter.load(Ordering::SeqCst), 2, "no guarantee without key");
}

#[tokio::test]
async fn in_progress_marker_yields_conflict() {
    let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
    // Simulate a concurrent execution holding the sentinel.
    store
        .set_nx(
            "idem:busy",
            "PROCESSING",
            std::time::Duration::from_secs(60),
        )
        .await
        .unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let app = counting_router(store, counter.clone());

    let response = app.oneshot(post_with_key(Some("busy"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(counter.load(Ordering::SeqCst), 0, "handler never ran");
}

#[tokio::test]
async fn failed_execution_deletes_record_for_retry() {
    let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
    let attempts = Arc::new(AtomicUsize::new(0));

    let app = {
        let attempts = attempts.clone();
        Router::new()
            .route(
                "/order",
                post(move || {
                    let attempts = attempts.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            // First attempt blows up.
                            (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
                        } else {
                            (StatusCode::OK, "recovered").into_response()
                        }
                    }
                }),
            )
            .layer(middleware::from_fn_with_state(
                store.clone(),
                idempotency_middleware,
            ))
    };

    let first = app.clone().oneshot(post_with_key(Some("retry-me"))).await.unwrap();
    assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // The failure must not leave a record behind.
    assert_eq!(store.get("idem:retry-me").await.unwrap(), None);

    let second = app.clone().oneshot(post_with_key(Some("retry-me"))).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_string(second).await, "recovered");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn distinct_keys_execute_independently() {
    let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let app = counting_router(store, counter.clone());

    let a = app.clone().oneshot(post_with_key(Some("key-a"))).await.unwrap();
    let b = app.clone().oneshot(post_with_key(Some("key-b"))).await.unwrap();
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);
    assert_ne!(body_string(a).await, body_string(b).await);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}
