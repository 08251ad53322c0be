//! Domain-focused API endpoint modules.
//!
//! Each sub-module owns a single responsibility area; handlers answer with
//! the uniform `{code, message, data}` envelope unless they stream.

mod ai;
mod home;
mod order;
mod recommendation;
mod user;

use axum::Json;

use medpulse_core::ApiResponse;

/// Liveness probe.
pub async fn health() -> Json<ApiResponse<serde_json::Value>> {
    Json(ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

// ── Re-exports ───────────────────────────────────────────────
// Preserves flat `api::foo` import paths used by main.rs route registration.

pub use ai::{ai_chat, create_session, session_list, session_message};
pub use home::article_list;
pub use order::{create_order, get_order_status, notify_callback};
pub use recommendation::{
    course_recommend, hot_courses, record_behavior, record_favorite, record_purchase,
    record_view,
};
pub use user::{login, refresh_token};
