//! Shared application context, built once in `main` and handed to handlers.
//!
//! No global singletons: every external collaborator (keyed store, database,
//! queue, LLM, embedder) hangs off this struct and is initialized in
//! dependency order during startup.

use std::sync::Arc;

use sqlx::PgPool;

use medpulse_cache::ListCache;
use medpulse_core::Config;
use medpulse_kv::KeyedStore;
use medpulse_llm::{Embedder, LlmProvider};
use medpulse_queue::KvQueue;

use crate::ws::ConnectionRegistry;

pub struct AppState {
    pub config: Config,
    /// Keyed coordination service: cache, locks, idempotency records,
    /// session memory, order status, queue backing lists.
    pub kv: Arc<dyn KeyedStore>,
    /// Relational store: articles, courses, users, behavior log sink.
    pub pg: PgPool,
    /// Stampede-protected list cache over `kv`.
    pub cache: ListCache,
    /// Durable queue for the behavior pipeline.
    pub queue: Arc<KvQueue>,
    /// Live WebSocket peers of this process.
    pub registry: ConnectionRegistry,
    /// Chat/RAG collaborators; absent when LLM credentials are missing, in
    /// which case the AI endpoints answer with a business error.
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    /// Outbound HTTP for third-party OAuth exchanges.
    pub http: reqwest::Client,
}
