//! Order endpoints: idempotent create, gateway callback, status poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use tracing::{info, warn};
use uuid::Uuid;

use medpulse_core::{ApiResponse, OrderCreate};

use crate::auth::CurrentUser;
use crate::error::AppError;
use crate::payment::PaymentMethod;
use crate::state::AppState;

/// Order status records expire after a day.
const ORDER_TTL: Duration = Duration::from_secs(60 * 60 * 24);

fn order_key(order_id: &str) -> String {
    format!("order:{order_id}")
}

/// `POST /api/v1/order/create` — wrapped by the idempotency gate at the
/// router, so retried requests with the same `Idempotency-Key` observe one
/// execution.
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(order_in): Json<OrderCreate>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    if order_in.amount < 0.0 {
        return Err(AppError::Validation("amount must not be negative".into()));
    }

    let method = PaymentMethod::resolve(
        &order_in.payment_method,
        order_in.amount,
        order_in.use_grain,
    )
    .ok_or_else(|| {
        AppError::business(
            400,
            format!("unsupported payment method: {}", order_in.payment_method),
        )
    })?;

    let order_id = Uuid::new_v4().to_string();
    let result = method.pay(&order_id, order_in.amount).await?;

    state
        .kv
        .set(&order_key(&order_id), &result.status, Some(ORDER_TTL))
        .await?;

    info!(
        order_id = %order_id,
        user_id = user.user_id,
        course_id = order_in.course_id,
        status = %result.status,
        "order created"
    );

    Ok(Json(ApiResponse::ok(serde_json::json!({
        "user_id": user.user_id,
        "order_id": order_id,
        "status": result.status,
        "course_id": order_in.course_id,
        "amount": order_in.amount,
        "payment_info": result,
    }))))
}

/// `POST /api/v1/order/notify/{payment_method}` — gateway callback. Answers
/// the plain `success`/`fail` body the gateways require.
pub async fn notify_callback(
    State(state): State<Arc<AppState>>,
    Path(payment_method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<String, AppError> {
    let method = PaymentMethod::from_name(&payment_method)
        .ok_or_else(|| AppError::business(400, format!("unsupported payment method: {payment_method}")))?;

    let data = parse_callback_body(&headers, &body)?;

    match method.handle_callback(&data)? {
        Some(order_id) => {
            state
                .kv
                .set(&order_key(&order_id), "COMPLETED", Some(ORDER_TTL))
                .await?;
            info!(order_id = %order_id, method = %payment_method, "payment confirmed");
            Ok("success".to_string())
        }
        None => {
            warn!(method = %payment_method, "payment callback without success state");
            Ok("fail".to_string())
        }
    }
}

/// `GET /api/v1/order/{order_id}` — polled status.
pub async fn get_order_status(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
    Path(order_id): Path<String>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    match state.kv.get(&order_key(&order_id)).await? {
        Some(status) => Ok(Json(ApiResponse::ok(serde_json::json!({
            "order_id": order_id,
            "status": status,
        })))),
        None => Err(AppError::NotFound("order not found or expired".into())),
    }
}

/// Gateways post either JSON or a form body depending on the channel.
fn parse_callback_body(
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<HashMap<String, String>, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/json") {
        let values: HashMap<String, serde_json::Value> = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("invalid callback JSON: {e}")))?;
        Ok(values
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect())
    } else {
        serde_urlencoded::from_bytes(body)
            .map_err(|e| AppError::Validation(format!("invalid callback form: {e}")))
    }
}
