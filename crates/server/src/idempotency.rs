//! Exactly-once execution gate for client-retried POSTs.
//!
//! Wraps a route: the first caller with a given `Idempotency-Key` header
//! owns the request; concurrent retries observe a `PROCESSING` sentinel
//! (409) and later retries replay the stored response byte-for-byte. A
//! failed execution deletes the record so a genuine retry can run.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use medpulse_kv::KeyedStore;

use crate::error::AppError;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const PROCESSING: &str = "PROCESSING";
const RECORD_TTL: Duration = Duration::from_secs(60 * 60 * 24);

/// Completed response as persisted in the keyed store.
#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    content_type: Option<String>,
    body: String,
}

fn record_key(key: &str) -> String {
    format!("idem:{key}")
}

enum Gate {
    /// This caller won the SETNX and must execute the handler.
    Winner,
    /// Another execution is still running.
    InProgress,
    /// A prior execution finished; replay its response.
    Replay(StoredResponse),
}

/// Attach with `middleware::from_fn_with_state(kv, idempotency_middleware)`
/// on the routes that accept an `Idempotency-Key`.
pub async fn idempotency_middleware(
    State(store): State<Arc<dyn KeyedStore>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(key) = req
        .headers()
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
        .map(str::to_string)
    else {
        // Opt-in model: without the header the caller forgoes the guarantee.
        debug!("request without Idempotency-Key, gate bypassed");
        return next.run(req).await;
    };

    let record = record_key(&key);

    let gate = loop {
        match store.set_nx(&record, PROCESSING, RECORD_TTL).await {
            Ok(true) => break Gate::Winner,
            Ok(false) => match store.get(&record).await {
                Ok(Some(value)) if value == PROCESSING => break Gate::InProgress,
                Ok(Some(value)) => match serde_json::from_str::<StoredResponse>(&value) {
                    Ok(stored) => break Gate::Replay(stored),
                    Err(e) => {
                        warn!(key = %key, error = %e, "corrupt idempotency record, replacing");
                        let _ = store.del(&record).await;
                        continue;
                    }
                },
                // TTL lapsed between SETNX and GET: treat as a new request.
                Ok(None) => continue,
                Err(e) => return AppError::from(e).into_response(),
            },
            Err(e) => return AppError::from(e).into_response(),
        }
    };

    match gate {
        Gate::InProgress => {
            AppError::Conflict("request with this Idempotency-Key is processing".into())
                .into_response()
        }
        Gate::Replay(stored) => replay(stored),
        Gate::Winner => {
            let response = next.run(req).await;
            finish_as_winner(store.as_ref(), &record, &key, response).await
        }
    }
}

/// Persist a successful response under the record key, or delete the record
/// on failure so the client may retry for real.
async fn finish_as_winner(
    store: &dyn KeyedStore,
    record: &str,
    key: &str,
    response: Response,
) -> Response {
    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(key = %key, error = %e, "failed to buffer response body");
            let _ = store.del(record).await;
            return AppError::internal(e).into_response();
        }
    };

    if parts.status.is_success() {
        match String::from_utf8(bytes.to_vec()) {
            Ok(body_text) => {
                let stored = StoredResponse {
                    status: parts.status.as_u16(),
                    content_type: parts
                        .headers
                        .get(header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                    body: body_text,
                };
                match serde_json::to_string(&stored) {
                    Ok(serialized) => {
                        if let Err(e) = store.set(record, &serialized, Some(RECORD_TTL)).await {
                            warn!(key = %key, error = %e, "failed to store idempotency result");
                        }
                    }
                    Err(e) => warn!(key = %key, error = %e, "failed to serialize response"),
                }
            }
            Err(_) => {
                // Non-UTF-8 bodies can't be replayed; drop the record so a
                // retry re-executes instead of replaying garbage.
                warn!(key = %key, "non-text response body, idempotency record dropped");
                let _ = store.del(record).await;
            }
        }
    } else {
        // A failed request is not a binding result.
        let _ = store.del(record).await;
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn replay(stored: StoredResponse) -> Response {
    let mut builder =
        Response::builder().status(StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK));
    if let Some(content_type) = stored.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(stored.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests;
