//! Login strategy dispatch and token refresh.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use medpulse_core::auth::{create_token, refresh_token as refresh_access};
use medpulse_core::ApiResponse;

use crate::error::AppError;
use crate::state::AppState;
use crate::store;

/// Closed set of login strategies, dispatched on the `strategy` tag.
#[derive(Debug, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum LoginRequest {
    Account { username: String, password: String },
    Sms { phone: String, code: String },
    Dingtalk { auth_code: String },
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

fn sms_code_key(phone: &str) -> String {
    format!("sms:code:{phone}")
}

fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// `POST /api/v1/user/login`
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<ApiResponse<TokenPair>>, AppError> {
    let user_id = match req {
        LoginRequest::Account { username, password } => {
            login_account(&state, &username, &password).await?
        }
        LoginRequest::Sms { phone, code } => login_sms(&state, &phone, &code).await?,
        LoginRequest::Dingtalk { auth_code } => login_dingtalk(&state, &auth_code).await?,
    };

    let jwt = &state.config.jwt;
    let access_token = create_token(jwt, user_id, jwt.access_ttl_minutes)?;
    let refresh_token = create_token(jwt, user_id, jwt.refresh_ttl_minutes)?;

    info!(user_id, "login succeeded");
    Ok(Json(ApiResponse::ok(TokenPair {
        access_token,
        refresh_token,
        token_type: "Bearer",
    })))
}

/// `POST /api/v1/user/refresh-token`
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let access_token = refresh_access(&state.config.jwt, &req.refresh_token)?;
    Ok(Json(ApiResponse::ok(serde_json::json!({
        "access_token": access_token,
        "token_type": "Bearer",
    }))))
}

async fn login_account(state: &AppState, username: &str, password: &str) -> Result<i64, AppError> {
    let user = store::find_user_by_username(&state.pg, username)
        .await?
        .ok_or_else(|| AppError::business(400, "incorrect username or password"))?;

    let stored = user
        .password_hash
        .as_deref()
        .ok_or_else(|| AppError::business(400, "account has no password login"))?;

    if stored != hash_password(password) {
        warn!(username = %username, "password mismatch");
        return Err(AppError::business(400, "incorrect username or password"));
    }
    Ok(user.id)
}

async fn login_sms(state: &AppState, phone: &str, code: &str) -> Result<i64, AppError> {
    let key = sms_code_key(phone);
    let stored = state
        .kv
        .get(&key)
        .await?
        .ok_or_else(|| AppError::business(400, "verification code expired"))?;

    if stored != code {
        return Err(AppError::business(400, "incorrect verification code"));
    }

    let user = store::find_user_by_phone(&state.pg, phone)
        .await?
        .ok_or_else(|| AppError::business(400, "phone number is not registered"))?;

    // One-shot code.
    state.kv.del(&key).await?;
    Ok(user.id)
}

/// Exchange the DingTalk auth code for the caller's union id, then resolve
/// the bound local account. Thin client over the external OAuth service.
async fn login_dingtalk(state: &AppState, auth_code: &str) -> Result<i64, AppError> {
    let dingtalk = &state.config.dingtalk;
    let (client_id, client_secret) = match (&dingtalk.client_id, &dingtalk.client_secret) {
        (Some(id), Some(secret)) => (id, secret),
        _ => return Err(AppError::business(503, "dingtalk login is not configured")),
    };

    let response = state
        .http
        .post("https://api.dingtalk.com/v1.0/oauth2/userAccessToken")
        .json(&serde_json::json!({
            "clientId": client_id,
            "clientSecret": client_secret,
            "code": auth_code,
            "grantType": "authorization_code",
        }))
        .send()
        .await
        .map_err(|e| AppError::business(502, format!("dingtalk exchange failed: {e}")))?;

    if !response.status().is_success() {
        return Err(AppError::business(400, "invalid dingtalk auth code"));
    }
    let token: serde_json::Value = response
        .json()
        .await
        .map_err(|e| AppError::business(502, format!("dingtalk exchange failed: {e}")))?;
    let access_token = token["accessToken"]
        .as_str()
        .ok_or_else(|| AppError::business(502, "dingtalk exchange returned no token"))?;

    let me: serde_json::Value = state
        .http
        .get("https://api.dingtalk.com/v1.0/contact/users/me")
        .header("x-acs-dingtalk-access-token", access_token)
        .send()
        .await
        .map_err(|e| AppError::business(502, format!("dingtalk profile fetch failed: {e}")))?
        .json()
        .await
        .map_err(|e| AppError::business(502, format!("dingtalk profile fetch failed: {e}")))?;

    let union_id = me["unionId"]
        .as_str()
        .ok_or_else(|| AppError::business(502, "dingtalk profile has no union id"))?;

    let user = store::find_user_by_dingtalk(&state.pg, union_id)
        .await?
        .ok_or_else(|| AppError::business(400, "dingtalk account is not bound to a user"))?;
    Ok(user.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_request_strategy_dispatch() {
        let account: LoginRequest = serde_json::from_str(
            r#"{"strategy":"account","username":"doc","password":"pw"}"#,
        )
        .unwrap();
        assert!(matches!(account, LoginRequest::Account { .. }));

        let sms: LoginRequest =
            serde_json::from_str(r#"{"strategy":"sms","phone":"555","code":"1234"}"#).unwrap();
        assert!(matches!(sms, LoginRequest::Sms { .. }));

        let dingtalk: LoginRequest =
            serde_json::from_str(r#"{"strategy":"dingtalk","auth_code":"abc"}"#).unwrap();
        assert!(matches!(dingtalk, LoginRequest::Dingtalk { .. }));

        assert!(serde_json::from_str::<LoginRequest>(r#"{"strategy":"carrier-pigeon"}"#).is_err());
    }

    #[test]
    fn password_hash_is_stable_hex() {
        let h = hash_password("secret");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_password("secret"));
        assert_ne!(h, hash_password("Secret"));
    }

    #[test]
    fn sms_key_layout() {
        assert_eq!(sms_code_key("13800001111"), "sms:code:13800001111");
    }
}
