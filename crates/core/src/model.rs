//! Domain models shared across crates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Behavior events ───────────────────────────────────────────

/// User interaction kind tracked by the behavior pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    View,
    Favorite,
    Unfavorite,
    Purchase,
    Study,
    Rate,
}

impl ActionType {
    /// Canonical weight used when the client does not supply `action_value`.
    pub fn weight(self) -> f64 {
        match self {
            ActionType::View => 1.0,
            ActionType::Favorite => 3.0,
            ActionType::Unfavorite => -2.0,
            ActionType::Purchase => 5.0,
            ActionType::Study => 4.0,
            ActionType::Rate => 4.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::View => "view",
            ActionType::Favorite => "favorite",
            ActionType::Unfavorite => "unfavorite",
            ActionType::Purchase => "purchase",
            ActionType::Study => "study",
            ActionType::Rate => "rate",
        }
    }
}

/// Client-facing request body for `record-behavior`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorRequest {
    pub course_id: i64,
    pub action_type: ActionType,
    #[serde(default)]
    pub action_value: Option<f64>,
    #[serde(default)]
    pub extra_info: HashMap<String, serde_json::Value>,
}

/// Fully enriched behavior event as published to the queue and appended to
/// the behavior log. `inserted_time` is stamped by the consumer, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub user_id: i64,
    pub course_id: i64,
    pub action_type: ActionType,
    pub action_value: f64,
    pub course_code: Option<String>,
    pub course_name: Option<String>,
    pub medical_department: Option<String>,
    pub difficulty_level: Option<i16>,
    #[serde(default)]
    pub extra_info: HashMap<String, serde_json::Value>,
    pub created_time: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

// ── Courses ───────────────────────────────────────────────────

/// Course row as fetched from the relational store.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Course {
    pub id: i64,
    pub course_code: String,
    pub course_name: String,
    pub medical_department: String,
    pub applicable_title: Option<String>,
    pub difficulty_level: i16,
    pub price: f64,
    /// 1 = published.
    pub status: i16,
    /// 1 = on sale.
    pub sale_status: i16,
    pub created_time: DateTime<Utc>,
}

impl Course {
    /// Only published, on-sale courses are recommendable.
    pub fn is_active(&self) -> bool {
        self.status == 1 && self.sale_status == 1
    }
}

// ── Articles ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub thumb: Option<String>,
    pub description: Option<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub article_type: String,
    pub input_time: DateTime<Utc>,
    pub comment_count: i32,
    pub content: String,
}

/// Serialized shape stored in the article list cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleView {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub description: Option<String>,
    pub comment_count: i32,
    #[serde(rename = "type")]
    pub article_type: String,
    pub url: String,
    pub thumb: Option<String>,
    pub input_time: Option<String>,
}

impl From<&Article> for ArticleView {
    fn from(a: &Article) -> Self {
        Self {
            id: a.id,
            title: a.title.clone(),
            content: a.content.clone(),
            description: a.description.clone(),
            comment_count: a.comment_count,
            article_type: a.article_type.clone(),
            url: a.url.clone(),
            thumb: a.thumb.clone(),
            input_time: Some(a.input_time.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

// ── Users ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub phone: Option<String>,
    pub password_hash: Option<String>,
    pub dingtalk_union_id: Option<String>,
}

// ── Orders ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreate {
    pub course_id: i64,
    pub amount: f64,
    pub payment_method: String,
    #[serde(default)]
    pub use_grain: bool,
}

// ── Chat ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message envelope in a chat session list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_weights_match_canonical_table() {
        assert_eq!(ActionType::View.weight(), 1.0);
        assert_eq!(ActionType::Favorite.weight(), 3.0);
        assert_eq!(ActionType::Unfavorite.weight(), -2.0);
        assert_eq!(ActionType::Purchase.weight(), 5.0);
        assert_eq!(ActionType::Study.weight(), 4.0);
        assert_eq!(ActionType::Rate.weight(), 4.0);
    }

    #[test]
    fn action_type_serializes_lowercase() {
        let json = serde_json::to_string(&ActionType::Unfavorite).unwrap();
        assert_eq!(json, "\"unfavorite\"");
        let back: ActionType = serde_json::from_str("\"purchase\"").unwrap();
        assert_eq!(back, ActionType::Purchase);
    }

    #[test]
    fn behavior_event_roundtrip() {
        let event = BehaviorEvent {
            user_id: 1,
            course_id: 9,
            action_type: ActionType::Favorite,
            action_value: 3.0,
            course_code: Some("MED-CARDIO-202501".into()),
            course_name: Some("Cardiology".into()),
            medical_department: Some("cardiology".into()),
            difficulty_level: Some(2),
            extra_info: HashMap::new(),
            created_time: Utc::now(),
            ip_address: Some("10.0.0.1".into()),
            user_agent: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: BehaviorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.course_id, 9);
        assert_eq!(back.action_value, 3.0);
        assert_eq!(back.action_type, ActionType::Favorite);
    }

    #[test]
    fn chat_message_envelope_shape() {
        let msg = ChatMessage {
            role: ChatRole::Assistant,
            content: "hello".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"role\":\"assistant\""));
    }
}
