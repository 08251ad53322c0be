//! Bearer-token authentication middleware and the `CurrentUser` extractor.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use medpulse_core::auth::verify_token;

use crate::error::AppError;
use crate::state::AppState;

/// Paths served without a bearer token. WebSocket upgrades are recognized
/// by their `Upgrade` header and authenticate via the token query parameter
/// at upgrade time instead.
const WHITELIST: &[&str] = &[
    "/health",
    "/api/v1/user/login",
    "/api/v1/user/refresh-token",
    "/api/v1/order/notify",
    "/api/v1/recommendation/hot-courses",
];

/// Verified caller identity, injected by the middleware.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser {
    pub user_id: i64,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .copied()
            .ok_or_else(|| AppError::Unauthorized("not logged in or session expired".into()))
    }
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();

    if WHITELIST.iter().any(|white| path.starts_with(white)) {
        return next.run(req).await;
    }

    if is_websocket_upgrade(req.headers()) {
        return next.run(req).await;
    }

    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(header) = header else {
        warn!(path = %path, "missing Authorization header");
        return AppError::Unauthorized("missing Authorization header".into()).into_response();
    };

    let Some(token) = header.strip_prefix("Bearer ").filter(|t| !t.is_empty()) else {
        warn!(path = %path, "invalid Authorization scheme");
        return AppError::Unauthorized("invalid Authorization scheme".into()).into_response();
    };

    match verify_token(&state.config.jwt, token) {
        Ok(user_id) => {
            req.extensions_mut().insert(CurrentUser { user_id });
            next.run(req).await
        }
        Err(e) => {
            warn!(path = %path, error = %e, "token verification failed");
            AppError::Unauthorized(e.to_string()).into_response()
        }
    }
}

fn is_websocket_upgrade(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_prefix_matching() {
        assert!(WHITELIST
            .iter()
            .any(|w| "/api/v1/order/notify/alipay".starts_with(w)));
        assert!(!WHITELIST
            .iter()
            .any(|w| "/api/v1/order/create".starts_with(w)));
        assert!(!WHITELIST
            .iter()
            .any(|w| "/api/v1/ws/send/b".starts_with(w)));
    }

    #[test]
    fn upgrade_header_detection() {
        let mut headers = axum::http::HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(axum::http::header::UPGRADE, "websocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));
        headers.insert(axum::http::header::UPGRADE, "WebSocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));
    }
}
