//! AI chat endpoints: streaming RAG chat and session management.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::Response;
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use medpulse_core::{ApiResponse, ChatMessage};

use crate::auth::CurrentUser;
use crate::chat;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

/// `POST /api/v1/ai/chat` — streams `text/event-stream` frames. Dropping
/// the connection cancels generation upstream.
pub async fn ai_chat(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    if req.question.trim().is_empty() {
        return Err(AppError::Validation("question must not be empty".into()));
    }

    let rx = chat::stream_chat(state.clone(), user.user_id, req.session_id, req.question).await;
    let stream = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(Bytes::from(frame)));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(AppError::internal)
}

/// `POST /api/v1/ai/chat/create-session`
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let session_id = chat::create_session(&state, user.user_id).await?;
    Ok(Json(ApiResponse::ok(serde_json::json!({
        "session_id": session_id,
    }))))
}

/// `GET /api/v1/ai/chat/session-list`
pub async fn session_list(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
) -> Result<Json<ApiResponse<Vec<std::collections::HashMap<String, String>>>>, AppError> {
    let sessions = chat::session_list(&state, user.user_id).await?;
    Ok(Json(ApiResponse::ok(sessions)))
}

/// `GET /api/v1/ai/chat/session-message?session_id=…`
pub async fn session_message(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Query(query): Query<SessionQuery>,
) -> Result<Json<ApiResponse<Vec<ChatMessage>>>, AppError> {
    let messages = chat::session_messages(&state, user.user_id, &query.session_id).await?;
    Ok(Json(ApiResponse::ok(messages)))
}
