//! Home endpoints: the stampede-protected article list.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use tracing::warn;

use medpulse_core::{ApiResponse, ArticleView};

use crate::auth::CurrentUser;
use crate::error::AppError;
use crate::state::AppState;
use crate::store;

#[derive(Debug, Deserialize)]
pub struct ArticleRequest {
    pub article_id: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

/// `POST /api/v1/home/article-list` — served out of the list cache under
/// key `article_list_{article_id}`; exactly one caller loads on a miss.
pub async fn article_list(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
    Json(req): Json<ArticleRequest>,
) -> Result<Json<ApiResponse<Vec<ArticleView>>>, AppError> {
    let cache_key = format!("article_list_{}", req.article_id);
    let pg = state.pg.clone();
    let limit = req.limit.clamp(1, 100);

    let (values, _outcome) = state
        .cache
        .get_or_load(&cache_key, || async move {
            let articles = store::list_articles_after(&pg, req.article_id, limit).await?;
            Ok::<_, sqlx::Error>(
                articles
                    .iter()
                    .map(ArticleView::from)
                    .filter_map(|view| serde_json::to_string(&view).ok())
                    .collect(),
            )
        })
        .await?;

    let data = values
        .iter()
        .filter_map(|raw| match serde_json::from_str(raw) {
            Ok(view) => Some(view),
            Err(e) => {
                warn!(error = %e, "skipping undecodable cached article");
                None
            }
        })
        .collect();

    Ok(Json(ApiResponse::ok(data)))
}
