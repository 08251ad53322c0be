mod api;
mod auth;
mod behavior;
mod chat;
mod error;
mod idempotency;
mod payment;
mod state;
mod store;
mod vector_store;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::{middleware, Router};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use medpulse_cache::{CacheConfig, ListCache};
use medpulse_core::Config;
use medpulse_kv::{KeyedStore, RedisStore};
use medpulse_llm::{Embedder, LlmProvider, OpenAiEmbedder, OpenAiProvider};
use medpulse_queue::KvQueue;

use crate::state::AppState;
use crate::ws::ConnectionRegistry;

/// Exit codes: 0 graceful, 1 config error, 2 bind failure, 3 required
/// dependency unreachable at startup.
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;
const EXIT_DEPENDENCY: i32 = 3;

fn router(state: Arc<AppState>, kv: Arc<dyn KeyedStore>) -> Router {
    let order_create = post(api::create_order).route_layer(middleware::from_fn_with_state(
        kv,
        idempotency::idempotency_middleware,
    ));

    Router::new()
        .route("/health", get(api::health))
        .route("/api/v1/user/login", post(api::login))
        .route("/api/v1/user/refresh-token", post(api::refresh_token))
        .route("/api/v1/home/article-list", post(api::article_list))
        .route("/api/v1/order/create", order_create)
        .route("/api/v1/order/notify/{payment_method}", post(api::notify_callback))
        .route("/api/v1/order/{order_id}", get(api::get_order_status))
        .route("/api/v1/recommendation/course-recommend", post(api::course_recommend))
        .route("/api/v1/recommendation/record-behavior", post(api::record_behavior))
        .route("/api/v1/recommendation/view/{course_id}", post(api::record_view))
        .route("/api/v1/recommendation/favorite/{course_id}", post(api::record_favorite))
        .route("/api/v1/recommendation/purchase/{course_id}", post(api::record_purchase))
        .route("/api/v1/recommendation/hot-courses", post(api::hot_courses))
        .route("/api/v1/ai/chat", post(api::ai_chat))
        .route("/api/v1/ai/chat/create-session", post(api::create_session))
        .route("/api/v1/ai/chat/session-list", get(api::session_list))
        .route("/api/v1/ai/chat/session-message", get(api::session_message))
        .route("/api/v1/ws/{client_id}", get(ws::ws_endpoint))
        .route("/api/v1/ws/send/{client_id}", post(ws::ws_send))
        .route("/api/v1/ws/broadcast", post(ws::ws_broadcast))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn serve(config: Config) -> Result<(), i32> {
    config.log_summary();

    // Keyed coordination service first: nothing works without it.
    let kv: Arc<dyn KeyedStore> = match RedisStore::connect(
        &config.redis.url,
        Duration::from_millis(config.redis.op_timeout_ms),
    )
    .await
    {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "keyed store unreachable at startup");
            return Err(EXIT_DEPENDENCY);
        }
    };

    let pg = match PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .connect(&config.postgres.connection_string())
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "postgres unreachable at startup");
            return Err(EXIT_DEPENDENCY);
        }
    };

    if let Err(e) = store::ensure_schema(
        &pg,
        &config.postgres.vector_collection,
        config.embedding.dimensions,
    )
    .await
    {
        error!(error = %e, "schema initialization failed");
        return Err(EXIT_DEPENDENCY);
    }

    // LLM/embedding are optional collaborators: the AI endpoints degrade to
    // a business error when credentials are absent.
    let llm: Option<Arc<dyn LlmProvider>> = match &config.llm.api_key {
        Some(key) => Some(Arc::new(OpenAiProvider::new(
            key.clone(),
            config.llm.model.clone(),
            config.llm.base_url.clone(),
            Duration::from_secs(config.llm.stream_timeout_secs),
        ))),
        None => {
            warn!("LLM_API_KEY not set — AI chat disabled");
            None
        }
    };
    let embedder: Option<Arc<dyn Embedder>> = match &config.embedding.api_key {
        Some(key) => Some(Arc::new(OpenAiEmbedder::new(
            key.clone(),
            config.embedding.model.clone(),
            config.embedding.base_url.clone(),
            config.embedding.dimensions as usize,
        ))),
        None => {
            warn!("EMBEDDING_API_KEY not set — retrieval disabled");
            None
        }
    };

    let cache = ListCache::new(kv.clone(), CacheConfig::default());
    let queue = Arc::new(KvQueue::new(
        kv.clone(),
        Duration::from_millis(config.queue.publish_timeout_ms),
    ));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState {
        config,
        kv: kv.clone(),
        pg,
        cache,
        queue,
        registry: ConnectionRegistry::new(),
        llm,
        embedder,
        http: reqwest::Client::new(),
    });

    let app = router(state.clone(), kv);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind listen address");
            return Err(EXIT_BIND);
        }
    };
    info!("server listening on http://{addr}");

    // Background pipeline tasks: behavior consumer plus the sweep that
    // requeues un-acked messages.
    tokio::spawn(behavior::run_consumer(state.clone()));
    tokio::spawn(behavior::run_redelivery_sweep(state.clone()));

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server terminated abnormally");
        return Err(EXIT_BIND);
    }

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    medpulse_core::config::load_dotenv();
    let config = Config::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(EXIT_CONFIG);
    }

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("serve") | None => {
            if let Err(code) = serve(config).await {
                std::process::exit(code);
            }
        }
        Some(other) => {
            eprintln!("unknown command: {other}");
            eprintln!("Usage: medpulse-server [serve]");
            std::process::exit(EXIT_CONFIG);
        }
    }
}
