//! Uniform `{code, message, data}` response envelope.
//!
//! All non-stream endpoints answer with this shape; `code` 200 means success
//! and 400..=599 carry the business failure code in the body.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub message: String,
    pub data: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            message: "success".into(),
            data: Some(data),
        }
    }

    pub fn ok_message(message: impl Into<String>) -> Self {
        Self {
            code: 200,
            message: message.into(),
            data: None,
        }
    }

    pub fn err(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl<T> ApiResponse<Page<T>> {
    pub fn page(items: Vec<T>, total: u64, page: u32, size: u32) -> Self {
        Self::ok(Page {
            items,
            total,
            page,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope() {
        let resp = ApiResponse::ok(vec![1, 2, 3]);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"code\":200"));
        assert!(json.contains("\"data\":[1,2,3]"));
    }

    #[test]
    fn err_envelope_carries_code() {
        let resp: ApiResponse<()> = ApiResponse::err(404, "order not found");
        assert_eq!(resp.code, 404);
        assert!(resp.data.is_none());
    }

    #[test]
    fn page_envelope_shape() {
        let resp = ApiResponse::page(vec!["a"], 10, 1, 20);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"total\":10"));
        assert!(json.contains("\"items\":[\"a\"]"));
    }
}
