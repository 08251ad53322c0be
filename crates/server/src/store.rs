//! Relational store access: opaque row fetches for articles, courses and
//! users, plus the append-only behavior log sink.

use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::info;

use medpulse_core::{Article, BehaviorEvent, Course, User};
use medpulse_recommend::BehaviorAggregate;

/// Create the tables this service owns: the behavior log sink with its query
/// indexes and the pgvector chunk store. Article/course/user tables belong
/// to the wider application and are only read here.
pub async fn ensure_schema(
    pool: &PgPool,
    vector_collection: &str,
    embedding_dims: u32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS user_behavior_log (
            id BIGSERIAL PRIMARY KEY,
            user_id BIGINT NOT NULL,
            course_id BIGINT NOT NULL,
            action_type TEXT NOT NULL,
            action_value DOUBLE PRECISION NOT NULL,
            course_code TEXT,
            course_name TEXT,
            medical_department TEXT,
            difficulty_level SMALLINT,
            extra_info TEXT,
            created_time TIMESTAMPTZ NOT NULL,
            ip_address TEXT,
            user_agent TEXT,
            inserted_time TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_behavior_user ON user_behavior_log (user_id)",
        "CREATE INDEX IF NOT EXISTS idx_behavior_course ON user_behavior_log (course_id)",
        "CREATE INDEX IF NOT EXISTS idx_behavior_action ON user_behavior_log (action_type)",
        "CREATE INDEX IF NOT EXISTS idx_behavior_created ON user_behavior_log (created_time)",
        "CREATE INDEX IF NOT EXISTS idx_behavior_user_course ON user_behavior_log (user_id, course_id)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(pool)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {vector_collection}_chunks (
            id BIGSERIAL PRIMARY KEY,
            content TEXT NOT NULL,
            embedding vector({embedding_dims})
        )"
    ))
    .execute(pool)
    .await?;

    info!("schema ensured (behavior log + vector chunks)");
    Ok(())
}

// ── Articles ──────────────────────────────────────────────────

pub async fn list_articles_after(
    pool: &PgPool,
    article_id: i64,
    limit: i64,
) -> Result<Vec<Article>, sqlx::Error> {
    sqlx::query_as::<_, Article>(
        "SELECT id, title, url, thumb, description, \"type\", input_time, comment_count, content
         FROM article
         WHERE id > $1 AND is_deleted = FALSE
         ORDER BY id
         LIMIT $2",
    )
    .bind(article_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

// ── Courses ───────────────────────────────────────────────────

pub async fn get_course(pool: &PgPool, id: i64) -> Result<Option<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>(
        "SELECT id, course_code, course_name, medical_department, applicable_title,
                difficulty_level, price, status, sale_status, created_time
         FROM medical_course
         WHERE id = $1 AND is_deleted = FALSE",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn list_courses(pool: &PgPool) -> Result<Vec<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>(
        "SELECT id, course_code, course_name, medical_department, applicable_title,
                difficulty_level, price, status, sale_status, created_time
         FROM medical_course
         WHERE is_deleted = FALSE",
    )
    .fetch_all(pool)
    .await
}

pub async fn get_courses_by_ids(pool: &PgPool, ids: &[i64]) -> Result<Vec<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>(
        "SELECT id, course_code, course_name, medical_department, applicable_title,
                difficulty_level, price, status, sale_status, created_time
         FROM medical_course
         WHERE id = ANY($1) AND is_deleted = FALSE",
    )
    .bind(ids)
    .fetch_all(pool)
    .await
}

// ── Users ─────────────────────────────────────────────────────

pub async fn find_user_by_username(
    pool: &PgPool,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, phone, password_hash, dingtalk_union_id
         FROM app_user WHERE username = $1",
    )
    .bind(username)
    .fetch_optional(pool)
    .await
}

pub async fn find_user_by_phone(pool: &PgPool, phone: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, phone, password_hash, dingtalk_union_id
         FROM app_user WHERE phone = $1",
    )
    .bind(phone)
    .fetch_optional(pool)
    .await
}

pub async fn find_user_by_dingtalk(
    pool: &PgPool,
    union_id: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, phone, password_hash, dingtalk_union_id
         FROM app_user WHERE dingtalk_union_id = $1",
    )
    .bind(union_id)
    .fetch_optional(pool)
    .await
}

// ── Behavior log ──────────────────────────────────────────────

/// Append one behavior event with the insertion timestamp. The log is
/// append-only; duplicates from queue redelivery are acceptable downstream.
pub async fn insert_behavior_event(
    pool: &PgPool,
    event: &BehaviorEvent,
) -> Result<(), sqlx::Error> {
    let extra = if event.extra_info.is_empty() {
        None
    } else {
        serde_json::to_string(&event.extra_info).ok()
    };

    sqlx::query(
        "INSERT INTO user_behavior_log
            (user_id, course_id, action_type, action_value, course_code, course_name,
             medical_department, difficulty_level, extra_info, created_time,
             ip_address, user_agent, inserted_time)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(event.user_id)
    .bind(event.course_id)
    .bind(event.action_type.as_str())
    .bind(event.action_value)
    .bind(&event.course_code)
    .bind(&event.course_name)
    .bind(&event.medical_department)
    .bind(event.difficulty_level)
    .bind(extra)
    .bind(event.created_time)
    .bind(&event.ip_address)
    .bind(&event.user_agent)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// `(user, course) -> Σ action_value` over the whole log, the recommender's
/// input matrix in row form.
pub async fn behavior_aggregates(pool: &PgPool) -> Result<Vec<BehaviorAggregate>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT user_id, course_id, SUM(action_value) AS total_weight
         FROM user_behavior_log
         GROUP BY user_id, course_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| BehaviorAggregate {
            user_id: row.get("user_id"),
            course_id: row.get("course_id"),
            total_weight: row.get("total_weight"),
        })
        .collect())
}
