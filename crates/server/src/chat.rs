//! Chat session memory and multi-query RAG orchestration.
//!
//! Per-(user, session) state lives in the keyed store: a metadata hash, an
//! append-only message list read through a rolling window, and a per-user
//! set of session ids. One request runs rewrite → multi-query expansion →
//! retrieval → streamed generation, then persists the exchange tail. A
//! caller that disconnects mid-stream cancels generation and the exchange
//! is treated as never having happened.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use medpulse_core::{ChatMessage, ChatRole};
use medpulse_llm::{Embedder, LlmProvider, Message};

use crate::error::AppError;
use crate::state::AppState;
use crate::vector_store;

/// Rolling window of history envelopes fed to the LLM.
const HISTORY_WINDOW: isize = 10;
/// Hard cap on vector searches per request.
const MAX_SEARCH_QUERIES: usize = 4;
/// Nearest neighbours fetched per query.
const RETRIEVAL_TOP_K: i64 = 2;
/// Stored `last_message` preview length, in characters.
const LAST_MESSAGE_PREFIX_CHARS: usize = 20;

const REWRITE_PROMPT: &str = "You are a search optimization expert. Using the \
conversation history, rewrite the user's latest question into one \
self-contained, semantically complete sentence (resolve pronouns and \
references, e.g. \"how is it treated\" becomes \"how is influenza A \
treated\"). Output only the rewritten sentence, nothing else.";

const MULTI_QUERY_PROMPT: &str = "You are an AI search assistant. Generate 3 \
alternative search queries for the original question below. Rules: include \
related medical terminology and synonyms; decompose a complex question into \
sub-questions; never change the user's intent. Output exactly 3 lines, one \
query per line, with no numbering and no explanations.";

// ── Keyed-store layout ───────────────────────────────────────

pub fn list_key(user_id: i64, session_id: &str) -> String {
    format!("chat:message:list:{user_id}:{session_id}")
}

pub fn hash_key(user_id: i64, session_id: &str) -> String {
    format!("chat:message:hash:{user_id}:{session_id}")
}

pub fn set_key(user_id: i64) -> String {
    format!("chat:message:set:{user_id}")
}

// ── Session bootstrap & listing ──────────────────────────────

/// Create a session: metadata hash plus registration in the user's session
/// set. The hash exists iff the id is in the set.
pub async fn create_session(state: &AppState, user_id: i64) -> Result<String, AppError> {
    let session_id = Uuid::new_v4().to_string();
    let created = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

    state
        .kv
        .hset(
            &hash_key(user_id, &session_id),
            &[
                ("last_message".to_string(), String::new()),
                ("created_time".to_string(), created),
                ("session_id".to_string(), session_id.clone()),
            ],
        )
        .await?;
    state.kv.sadd(&set_key(user_id), &session_id).await?;

    info!(user_id, session_id = %session_id, "chat session created");
    Ok(session_id)
}

pub async fn session_list(
    state: &AppState,
    user_id: i64,
) -> Result<Vec<HashMap<String, String>>, AppError> {
    let session_ids = state.kv.smembers(&set_key(user_id)).await?;

    let mut sessions = Vec::with_capacity(session_ids.len());
    for session_id in session_ids {
        let info = state.kv.hgetall(&hash_key(user_id, &session_id)).await?;
        if !info.is_empty() {
            sessions.push(info);
        }
    }
    sessions.sort_by(|a, b| {
        b.get("created_time")
            .cmp(&a.get("created_time"))
            .then(a.get("session_id").cmp(&b.get("session_id")))
    });
    Ok(sessions)
}

pub async fn session_messages(
    state: &AppState,
    user_id: i64,
    session_id: &str,
) -> Result<Vec<ChatMessage>, AppError> {
    let raw = state
        .kv
        .lrange(&list_key(user_id, session_id), 0, -1)
        .await?;
    Ok(parse_history(&raw))
}

// ── Chat request ─────────────────────────────────────────────

/// Run one chat turn, writing `data: …` SSE frames into the returned
/// channel. Dropping the receiver (client disconnect) cancels generation
/// and skips the persistence step.
pub async fn stream_chat(
    state: Arc<AppState>,
    user_id: i64,
    session_id: String,
    question: String,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>(32);

    tokio::spawn(async move {
        if let Err(e) = run_chat(&state, user_id, &session_id, &question, &tx).await {
            warn!(user_id, session_id = %session_id, error = %e, "chat turn failed");
            let _ = tx
                .send(format!("event: error\ndata: {e}\n\n"))
                .await;
        }
    });

    rx
}

async fn run_chat(
    state: &AppState,
    user_id: i64,
    session_id: &str,
    question: &str,
    tx: &mpsc::Sender<String>,
) -> Result<(), AppError> {
    let llm = state
        .llm
        .as_ref()
        .ok_or_else(|| AppError::business(503, "AI assistant is not configured"))?;
    let embedder = state
        .embedder
        .as_ref()
        .ok_or_else(|| AppError::business(503, "AI assistant is not configured"))?;

    // 1. Rolling history window.
    let raw = state
        .kv
        .lrange(&list_key(user_id, session_id), -HISTORY_WINDOW, -1)
        .await?;
    let history = parse_history(&raw);

    // 2. Rewrite into a self-contained question when history exists.
    let standalone = rewrite_question(llm.as_ref(), state, question, &history).await;
    debug!(user_id, standalone = %standalone, "rewrote question");

    // 3. Multi-query expansion, original first, capped.
    let queries = expand_queries(llm.as_ref(), state, &standalone).await;
    debug!(user_id, count = queries.len(), "expanded search queries");

    // 4. Retrieval: union across queries, dedup by exact stripped content.
    let context_chunks = retrieve(state, embedder.as_ref(), &queries).await;
    info!(
        user_id,
        session_id = %session_id,
        chunks = context_chunks.len(),
        "retrieved context"
    );

    // 5. Streamed generation: RAG system prompt + history + original question.
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(rag_system_prompt(&context_chunks)));
    for msg in &history {
        messages.push(match msg.role {
            ChatRole::User => Message::user(msg.content.clone()),
            ChatRole::Assistant => Message::assistant(msg.content.clone()),
        });
    }
    messages.push(Message::user(question.to_string()));

    let mut chunks = llm
        .complete_stream(
            messages,
            state.config.llm.temperature,
            state.config.llm.max_tokens,
        )
        .await
        .map_err(|e| AppError::internal(e))?;

    let mut answer = String::new();
    while let Some(chunk) = chunks.recv().await {
        let text = chunk.map_err(|e| AppError::internal(e))?;
        answer.push_str(&text);
        if tx.send(format!("data: {text}\n\n")).await.is_err() {
            // Client went away: drop the LLM receiver (cancels generation)
            // and treat the exchange as never having happened.
            debug!(user_id, session_id = %session_id, "client disconnected mid-stream");
            return Ok(());
        }
    }

    // 6. Persist the exchange tail only after a completed stream.
    persist_exchange(state, user_id, session_id, question, &answer).await?;
    Ok(())
}

async fn rewrite_question(
    llm: &dyn LlmProvider,
    state: &AppState,
    question: &str,
    history: &[ChatMessage],
) -> String {
    if history.is_empty() {
        return question.to_string();
    }

    let transcript = history
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            format!("{role}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let messages = vec![
        Message::system(REWRITE_PROMPT),
        Message::user(format!(
            "[Conversation history]\n{transcript}\n\n[Latest question]\n{question}"
        )),
    ];

    match llm
        .complete(messages, state.config.llm.temperature, 256)
        .await
    {
        Ok(rewritten) if !rewritten.trim().is_empty() => rewritten.trim().to_string(),
        Ok(_) => question.to_string(),
        Err(e) => {
            warn!(error = %e, "history rewrite failed, using raw question");
            question.to_string()
        }
    }
}

async fn expand_queries(llm: &dyn LlmProvider, state: &AppState, standalone: &str) -> Vec<String> {
    let messages = vec![
        Message::system(MULTI_QUERY_PROMPT),
        Message::user(format!("Original question: {standalone}")),
    ];

    match llm
        .complete(messages, state.config.llm.temperature, 256)
        .await
    {
        Ok(output) => parse_queries(standalone, &output),
        Err(e) => {
            warn!(error = %e, "multi-query expansion failed, searching raw question only");
            vec![standalone.to_string()]
        }
    }
}

async fn retrieve(state: &AppState, embedder: &dyn Embedder, queries: &[String]) -> Vec<String> {
    let search_timeout = Duration::from_millis(state.config.embedding.search_timeout_ms);
    let mut collected = Vec::new();

    for query in queries {
        let embedding = match embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(query = %query, error = %e, "embedding failed, skipping query");
                continue;
            }
        };

        let search = vector_store::search_chunks(
            &state.pg,
            &state.config.postgres.vector_collection,
            embedding,
            RETRIEVAL_TOP_K,
        );
        match tokio::time::timeout(search_timeout, search).await {
            Ok(Ok(chunks)) => collected.extend(chunks.into_iter().map(|c| c.content)),
            Ok(Err(e)) => warn!(query = %query, error = %e, "vector search failed"),
            Err(_) => warn!(query = %query, "vector search timed out"),
        }
    }

    dedupe_contexts(collected)
}

async fn persist_exchange(
    state: &AppState,
    user_id: i64,
    session_id: &str,
    question: &str,
    answer: &str,
) -> Result<(), AppError> {
    let envelopes = [
        ChatMessage {
            role: ChatRole::User,
            content: question.to_string(),
        },
        ChatMessage {
            role: ChatRole::Assistant,
            content: answer.to_string(),
        },
    ];
    let serialized: Vec<String> = envelopes
        .iter()
        .filter_map(|m| serde_json::to_string(m).ok())
        .collect();

    state
        .kv
        .rpush(&list_key(user_id, session_id), &serialized)
        .await?;
    state
        .kv
        .hset(
            &hash_key(user_id, session_id),
            &[(
                "last_message".to_string(),
                answer_prefix(answer, LAST_MESSAGE_PREFIX_CHARS),
            )],
        )
        .await?;
    Ok(())
}

// ── Pure helpers ─────────────────────────────────────────────

fn parse_history(raw: &[String]) -> Vec<ChatMessage> {
    raw.iter()
        .filter_map(|item| serde_json::from_str(item).ok())
        .collect()
}

/// One query per non-empty line; the standalone question always leads and
/// the total is capped at [`MAX_SEARCH_QUERIES`].
fn parse_queries(standalone: &str, llm_output: &str) -> Vec<String> {
    let mut queries: Vec<String> = llm_output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if queries.is_empty() {
        return vec![standalone.to_string()];
    }
    if !queries.iter().any(|q| q == standalone) {
        queries.insert(0, standalone.to_string());
    }
    queries.truncate(MAX_SEARCH_QUERIES);
    queries
}

/// Dedupe retrieved chunks by exact stripped content, keeping first-seen
/// order.
fn dedupe_contexts(chunks: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    chunks
        .into_iter()
        .filter(|chunk| seen.insert(chunk.trim().to_string()))
        .collect()
}

fn rag_system_prompt(context_chunks: &[String]) -> String {
    let context = context_chunks.join("\n\n");
    format!(
        "You are a professional medical assistant. Answer the user's \
question using the reference information below.\n\nGuidelines:\n1. \
Synthesize across the references and answer clearly.\n2. If the references \
do not contain the answer, say so explicitly instead of guessing.\n3. Keep \
a warm, professional tone.\n\n[References]\n{context}"
    )
}

/// Character-bounded preview stored as the session's `last_message`.
fn answer_prefix(answer: &str, max_chars: usize) -> String {
    answer.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(list_key(7, "s1"), "chat:message:list:7:s1");
        assert_eq!(hash_key(7, "s1"), "chat:message:hash:7:s1");
        assert_eq!(set_key(7), "chat:message:set:7");
    }

    #[test]
    fn parse_queries_prepends_standalone() {
        let queries = parse_queries(
            "how is influenza A treated",
            "influenza A treatment options\nantivirals for flu\nfever management in flu",
        );
        assert_eq!(queries.len(), 4);
        assert_eq!(queries[0], "how is influenza A treated");
    }

    #[test]
    fn parse_queries_caps_at_four() {
        let queries = parse_queries("q", "a\nb\nc\nd\ne\nf");
        assert_eq!(queries.len(), 4);
        assert_eq!(queries[0], "q");
    }

    #[test]
    fn parse_queries_keeps_standalone_once() {
        let queries = parse_queries("flu symptoms", "flu symptoms\ninfluenza signs");
        assert_eq!(queries[0], "flu symptoms");
        assert_eq!(queries.iter().filter(|q| *q == "flu symptoms").count(), 1);
    }

    #[test]
    fn parse_queries_empty_output_falls_back() {
        let queries = parse_queries("original", "\n  \n");
        assert_eq!(queries, vec!["original".to_string()]);
    }

    #[test]
    fn dedupe_by_stripped_content() {
        let chunks = vec![
            "influenza is viral".to_string(),
            "  influenza is viral  ".to_string(),
            "treatment is supportive".to_string(),
        ];
        let unique = dedupe_contexts(chunks);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0], "influenza is viral");
    }

    #[test]
    fn answer_prefix_counts_characters_not_bytes() {
        let answer = "流感的治疗方法包括充分休息和补液以及对症处理退热";
        let prefix = answer_prefix(answer, 20);
        assert_eq!(prefix.chars().count(), 20);
    }

    #[test]
    fn parse_history_skips_bad_entries() {
        let raw = vec![
            r#"{"role":"user","content":"what is influenza A?"}"#.to_string(),
            "not json".to_string(),
            r#"{"role":"assistant","content":"a viral infection"}"#.to_string(),
        ];
        let history = parse_history(&raw);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[1].role, ChatRole::Assistant);
    }

    #[test]
    fn rag_prompt_embeds_context() {
        let prompt = rag_system_prompt(&["chunk one".to_string(), "chunk two".to_string()]);
        assert!(prompt.contains("chunk one\n\nchunk two"));
        assert!(prompt.contains("[References]"));
    }
}
