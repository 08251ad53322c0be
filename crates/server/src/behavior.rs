//! Behavior event pipeline: HTTP publisher, background consumer, and the
//! redelivery sweep that keeps delivery at-least-once.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::Utc;
use tracing::{error, info, warn};

use medpulse_core::{BehaviorEvent, BehaviorRequest, Course};
use medpulse_queue::{QueueConsumer, QueuePublisher};

use crate::state::AppState;
use crate::store;

/// Client metadata captured at the HTTP edge.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientMeta {
    /// First `X-Forwarded-For` hop wins; falls back to nothing rather than
    /// the socket address, which is a proxy in every deployment we run.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let user_agent = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self { ip, user_agent }
    }
}

/// Assemble the enriched event: default weight from the action table when
/// the client sent no explicit value, plus the course snapshot.
pub fn build_event(
    user_id: i64,
    request: &BehaviorRequest,
    course: &Course,
    meta: &ClientMeta,
) -> BehaviorEvent {
    let action_value = request
        .action_value
        .unwrap_or_else(|| request.action_type.weight());

    BehaviorEvent {
        user_id,
        course_id: request.course_id,
        action_type: request.action_type,
        action_value,
        course_code: Some(course.course_code.clone()),
        course_name: Some(course.course_name.clone()),
        medical_department: Some(course.medical_department.clone()),
        difficulty_level: Some(course.difficulty_level),
        extra_info: request.extra_info.clone(),
        created_time: Utc::now(),
        ip_address: meta.ip.clone(),
        user_agent: meta.user_agent.clone(),
    }
}

/// Publish one behavior event. Returns `false` on any validation or publish
/// failure — behavior recording must never break the calling endpoint.
pub async fn record(
    state: &AppState,
    user_id: i64,
    request: &BehaviorRequest,
    meta: &ClientMeta,
) -> bool {
    let course = match store::get_course(&state.pg, request.course_id).await {
        Ok(Some(course)) => course,
        Ok(None) => {
            warn!(course_id = request.course_id, "behavior rejected: course does not exist");
            return false;
        }
        Err(e) => {
            error!(course_id = request.course_id, error = %e, "course lookup failed");
            return false;
        }
    };

    let event = build_event(user_id, request, &course, meta);
    let body = match serde_json::to_string(&event) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to serialize behavior event");
            return false;
        }
    };

    match state
        .queue
        .publish(&state.config.queue.behavior_queue, &body)
        .await
    {
        Ok(()) => {
            info!(
                user_id,
                course_id = request.course_id,
                action = event.action_type.as_str(),
                "behavior recorded"
            );
            true
        }
        Err(e) => {
            error!(error = %e, "behavior publish failed");
            false
        }
    }
}

/// Long-lived consumer: queue → behavior log. Acks only after a successful
/// insert; insert failures leave the message parked for redelivery. Errors
/// never propagate to HTTP.
pub async fn run_consumer(state: Arc<AppState>) {
    let queue_name = state.config.queue.behavior_queue.clone();
    let idle = Duration::from_millis(state.config.queue.poll_interval_ms);
    info!(queue = %queue_name, "behavior consumer started");

    loop {
        match state.queue.poll(&queue_name).await {
            Ok(Some(msg)) => {
                let event: BehaviorEvent = match serde_json::from_str(&msg.body) {
                    Ok(event) => event,
                    Err(e) => {
                        // A malformed payload can never succeed; ack it away
                        // instead of redelivering forever.
                        error!(message_id = %msg.id, error = %e, "dropping poison behavior message");
                        if let Err(e) = state.queue.ack(&queue_name, &msg.receipt_handle).await {
                            warn!(message_id = %msg.id, error = %e, "failed to ack poison message");
                        }
                        continue;
                    }
                };

                match store::insert_behavior_event(&state.pg, &event).await {
                    Ok(()) => {
                        if let Err(e) = state.queue.ack(&queue_name, &msg.receipt_handle).await {
                            warn!(message_id = %msg.id, error = %e, "insert succeeded but ack failed");
                        }
                    }
                    Err(e) => {
                        // No ack: the message stays parked and the sweep
                        // will hand it back to us.
                        error!(message_id = %msg.id, error = %e, "behavior log insert failed");
                        tokio::time::sleep(idle).await;
                    }
                }
            }
            Ok(None) => tokio::time::sleep(idle).await,
            Err(e) => {
                warn!(error = %e, "queue poll failed, backing off");
                tokio::time::sleep(idle).await;
            }
        }
    }
}

/// Periodically return un-acked messages to the queue.
pub async fn run_redelivery_sweep(state: Arc<AppState>) {
    let queue_name = state.config.queue.behavior_queue.clone();
    let grace = state.config.queue.redeliver_after_secs;
    let mut ticker = tokio::time::interval(Duration::from_secs(grace.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match state
            .queue
            .redeliver_pending(&queue_name, grace as i64)
            .await
        {
            Ok(0) => {}
            Ok(n) => info!(queue = %queue_name, count = n, "requeued stuck messages"),
            Err(e) => warn!(queue = %queue_name, error = %e, "redelivery sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use medpulse_core::ActionType;

    use super::*;

    fn course() -> Course {
        Course {
            id: 9,
            course_code: "MED-CARDIO-202501".into(),
            course_name: "Clinical Cardiology".into(),
            medical_department: "cardiology".into(),
            applicable_title: None,
            difficulty_level: 2,
            price: 99.0,
            status: 1,
            sale_status: 1,
            created_time: chrono::Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn default_weight_filled_from_action_table() {
        let request = BehaviorRequest {
            course_id: 9,
            action_type: ActionType::Favorite,
            action_value: None,
            extra_info: Default::default(),
        };
        let event = build_event(1, &request, &course(), &ClientMeta::default());
        assert_eq!(event.action_value, 3.0);
        assert_eq!(event.course_code.as_deref(), Some("MED-CARDIO-202501"));
        assert_eq!(event.medical_department.as_deref(), Some("cardiology"));
    }

    #[test]
    fn explicit_action_value_wins() {
        let request = BehaviorRequest {
            course_id: 9,
            action_type: ActionType::Rate,
            action_value: Some(4.5),
            extra_info: Default::default(),
        };
        let event = build_event(1, &request, &course(), &ClientMeta::default());
        assert_eq!(event.action_value, 4.5);
    }

    #[test]
    fn first_forwarded_hop_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.7, 10.0.0.1, 10.0.0.2".parse().unwrap(),
        );
        headers.insert("user-agent", "test-agent/1.0".parse().unwrap());

        let meta = ClientMeta::from_headers(&headers);
        assert_eq!(meta.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(meta.user_agent.as_deref(), Some("test-agent/1.0"));
    }

    #[test]
    fn absent_forwarding_header_yields_none() {
        let meta = ClientMeta::from_headers(&HeaderMap::new());
        assert_eq!(meta.ip, None);
    }
}
