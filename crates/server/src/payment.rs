//! Payment strategy dispatch.
//!
//! A closed set of methods, each with a `pay` capability and (for gateway
//! methods) callback handling. The name lookup replaces the source system's
//! class registry; zero-amount and grain purchases collapse onto `Free`.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    Free,
    Alipay,
    Wechat,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentResult {
    pub is_instant_success: bool,
    /// PENDING, COMPLETED or FAILED.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub message: String,
}

impl PaymentMethod {
    /// Name table: `grain` purchases reuse the free strategy.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "free" | "grain" => Some(Self::Free),
            "alipay" => Some(Self::Alipay),
            "wechat" => Some(Self::Wechat),
            _ => None,
        }
    }

    /// Resolve the effective method for an order: zero-amount and grain
    /// purchases are free regardless of what the client asked for.
    pub fn resolve(requested: &str, amount: f64, use_grain: bool) -> Option<Self> {
        if amount == 0.0 || use_grain {
            return Some(Self::Free);
        }
        Self::from_name(requested)
    }

    pub async fn pay(&self, order_id: &str, amount: f64) -> Result<PaymentResult, AppError> {
        match self {
            Self::Free => Ok(PaymentResult {
                is_instant_success: true,
                status: "COMPLETED".into(),
                payment_url: None,
                transaction_id: Some(Uuid::new_v4().to_string()),
                message: "payment completed".into(),
            }),
            Self::Alipay => {
                let url = format!(
                    "https://openapi.alipay.com/gateway.do?out_trade_no={order_id}&total_amount={amount:.2}"
                );
                info!(order_id = %order_id, "alipay payment initiated");
                Ok(PaymentResult {
                    is_instant_success: false,
                    status: "PENDING".into(),
                    payment_url: Some(url),
                    transaction_id: None,
                    message: "complete the payment in Alipay".into(),
                })
            }
            Self::Wechat => {
                let url = format!("weixin://wxpay/bizpayurl?pr={order_id}&amt={amount:.2}");
                info!(order_id = %order_id, "wechat payment initiated");
                Ok(PaymentResult {
                    is_instant_success: false,
                    status: "PENDING".into(),
                    payment_url: Some(url),
                    transaction_id: None,
                    message: "scan the QR code in WeChat to pay".into(),
                })
            }
        }
    }

    /// Gateway callback: verify and extract the order id of a successful
    /// payment. `Free` has no gateway and therefore no callback.
    pub fn handle_callback(
        &self,
        data: &HashMap<String, String>,
    ) -> Result<Option<String>, AppError> {
        match self {
            Self::Free => Err(AppError::business(
                400,
                "payment method does not support callbacks",
            )),
            Self::Alipay => {
                // Signature must be present and verifiable at this boundary;
                // the cryptographic check lives in the gateway SDK.
                if !data.contains_key("sign") {
                    warn!("alipay callback missing signature");
                    return Err(AppError::business(400, "invalid alipay signature"));
                }
                if data.get("trade_status").map(String::as_str) == Some("TRADE_SUCCESS") {
                    Ok(data.get("out_trade_no").cloned())
                } else {
                    Ok(None)
                }
            }
            Self::Wechat => {
                if data.get("result_code").map(String::as_str) == Some("SUCCESS") {
                    Ok(data.get("order_id").cloned())
                } else {
                    Ok(None)
                }
            }
        }
    }
}
