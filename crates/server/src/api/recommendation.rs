//! Recommendation endpoints: behavior recording and item-CF course
//! recommendations with silent degradation to popularity.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use medpulse_core::{ActionType, ApiResponse, BehaviorRequest, Course};
use medpulse_recommend::{CourseAttributes, Recommendation, Recommender};

use crate::auth::CurrentUser;
use crate::behavior::{self, ClientMeta};
use crate::state::AppState;
use crate::store;

#[derive(Debug, Deserialize)]
pub struct RecommendationRequest {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_exclude")]
    pub exclude_interacted: bool,
}

fn default_top_n() -> usize {
    10
}

fn default_exclude() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct RecommendationItem {
    pub course_id: i64,
    pub course_code: String,
    pub course_name: String,
    pub medical_department: String,
    pub difficulty_level: i16,
    pub price: f64,
    pub recommendation_score: f64,
    pub recommendation_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RecommendationResponse {
    pub user_id: i64,
    pub total: usize,
    pub recommendations: Vec<RecommendationItem>,
}

// ── Behavior recording ───────────────────────────────────────

/// `POST /api/v1/recommendation/record-behavior`
pub async fn record_behavior(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    headers: HeaderMap,
    Json(req): Json<BehaviorRequest>,
) -> Json<ApiResponse<()>> {
    let meta = ClientMeta::from_headers(&headers);
    if behavior::record(&state, user.user_id, &req, &meta).await {
        Json(ApiResponse::ok_message("behavior recorded"))
    } else {
        Json(ApiResponse::err(400, "behavior recording failed"))
    }
}

async fn record_shortcut(
    state: &AppState,
    user: CurrentUser,
    headers: &HeaderMap,
    course_id: i64,
    action_type: ActionType,
) -> Json<ApiResponse<()>> {
    let req = BehaviorRequest {
        course_id,
        action_type,
        action_value: None,
        extra_info: HashMap::new(),
    };
    let meta = ClientMeta::from_headers(headers);
    if behavior::record(state, user.user_id, &req, &meta).await {
        Json(ApiResponse::ok_message("behavior recorded"))
    } else {
        Json(ApiResponse::err(400, "behavior recording failed"))
    }
}

/// `POST /api/v1/recommendation/view/{course_id}`
pub async fn record_view(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(course_id): Path<i64>,
    headers: HeaderMap,
) -> Json<ApiResponse<()>> {
    record_shortcut(&state, user, &headers, course_id, ActionType::View).await
}

/// `POST /api/v1/recommendation/favorite/{course_id}`
pub async fn record_favorite(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(course_id): Path<i64>,
    headers: HeaderMap,
) -> Json<ApiResponse<()>> {
    record_shortcut(&state, user, &headers, course_id, ActionType::Favorite).await
}

/// `POST /api/v1/recommendation/purchase/{course_id}`
pub async fn record_purchase(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(course_id): Path<i64>,
    headers: HeaderMap,
) -> Json<ApiResponse<()>> {
    record_shortcut(&state, user, &headers, course_id, ActionType::Purchase).await
}

// ── Recommendations ──────────────────────────────────────────

/// `POST /api/v1/recommendation/course-recommend`
pub async fn course_recommend(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(req): Json<RecommendationRequest>,
) -> Json<ApiResponse<RecommendationResponse>> {
    let top_n = req.top_n.clamp(1, 50);
    let recommendations =
        build_recommendations(&state, user.user_id, top_n, req.exclude_interacted).await;

    Json(ApiResponse::ok(RecommendationResponse {
        user_id: user.user_id,
        total: recommendations.len(),
        recommendations,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HotQuery {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

/// `POST /api/v1/recommendation/hot-courses` — popularity only, public.
pub async fn hot_courses(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HotQuery>,
) -> Json<ApiResponse<serde_json::Value>> {
    let top_n = query.top_n.clamp(1, 50);
    let (rows, courses) = load_inputs(&state).await;
    let attrs: Vec<CourseAttributes> = courses.iter().map(to_attributes).collect();
    let recs = Recommender::popular(&rows, &attrs, top_n, &Default::default());
    let items = join_details(&recs, &courses);

    Json(ApiResponse::ok(serde_json::json!({
        "total": items.len(),
        "courses": items,
    })))
}

/// Gather log aggregates and the catalogue, score, and join course details.
/// Any failure degrades toward popularity over whatever data survived
/// instead of propagating.
async fn build_recommendations(
    state: &AppState,
    user_id: i64,
    top_n: usize,
    exclude_interacted: bool,
) -> Vec<RecommendationItem> {
    let (rows, courses) = load_inputs(state).await;
    let attrs: Vec<CourseAttributes> = courses.iter().map(to_attributes).collect();
    let recs = Recommender::recommend(&rows, &attrs, user_id, top_n, exclude_interacted);
    join_details(&recs, &courses)
}

async fn load_inputs(
    state: &AppState,
) -> (Vec<medpulse_recommend::BehaviorAggregate>, Vec<Course>) {
    let rows = match store::behavior_aggregates(&state.pg).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "behavior aggregation failed, degrading to catalogue only");
            Vec::new()
        }
    };
    let courses = match store::list_courses(&state.pg).await {
        Ok(courses) => courses,
        Err(e) => {
            error!(error = %e, "course catalogue fetch failed");
            Vec::new()
        }
    };
    (rows, courses)
}

fn to_attributes(course: &Course) -> CourseAttributes {
    CourseAttributes {
        id: course.id,
        medical_department: course.medical_department.clone(),
        difficulty_level: course.difficulty_level,
        applicable_title: course.applicable_title.clone(),
        status: course.status,
        sale_status: course.sale_status,
        created_time: course.created_time,
    }
}

fn join_details(recs: &[Recommendation], courses: &[Course]) -> Vec<RecommendationItem> {
    let by_id: HashMap<i64, &Course> = courses.iter().map(|c| (c.id, c)).collect();
    recs.iter()
        .filter_map(|rec| {
            by_id.get(&rec.course_id).map(|course| RecommendationItem {
                course_id: course.id,
                course_code: course.course_code.clone(),
                course_name: course.course_name.clone(),
                medical_department: course.medical_department.clone(),
                difficulty_level: course.difficulty_level,
                price: course.price,
                recommendation_score: (rec.score * 10_000.0).round() / 10_000.0,
                recommendation_reason: rec.reason.label(),
            })
        })
        .collect()
}
