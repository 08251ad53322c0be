use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{LlmError, LlmProvider, Message};
use crate::providers::sse::{drain_lines, parse_sse_line, SseEvent};

/// OpenAI-compatible chat completion provider (also fronts Qwen/DashScope
/// style gateways that speak the same wire protocol).
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    stream_timeout: Duration,
}

// ── Wire types ───────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url,
            stream_timeout,
        }
    }

    /// POST a chat completion, failing on any non-success status. Both the
    /// blocking and streaming paths go through this gate.
    async fn send_chat(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature,
            max_tokens,
            stream,
        };

        debug!(model = %self.model, stream, "chat completion request");

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let response = self
            .send_chat(&messages, temperature, max_tokens, false)
            .await?;

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::ParseError("completion carried no content".into()))
    }

    async fn complete_stream(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
        let response = self
            .send_chat(&messages, temperature, max_tokens, true)
            .await?;

        let (tx, rx) = mpsc::channel(32);
        let stream_timeout = self.stream_timeout;

        tokio::spawn(async move {
            let produce = async {
                let mut bytes = response.bytes_stream();
                let mut buffer = String::new();

                while let Some(chunk) = bytes.next().await {
                    let chunk = match chunk {
                        Ok(c) => c,
                        Err(e) => {
                            let _ = tx.send(Err(LlmError::HttpError(e))).await;
                            return;
                        }
                    };
                    buffer.push_str(&String::from_utf8_lossy(&chunk));

                    for line in drain_lines(&mut buffer) {
                        match parse_sse_line(&line) {
                            SseEvent::Delta(text) => {
                                // A closed receiver means the caller went
                                // away: stop generating.
                                if tx.send(Ok(text)).await.is_err() {
                                    return;
                                }
                            }
                            SseEvent::Done => return,
                            SseEvent::Ignore => {}
                        }
                    }
                }
            };

            if tokio::time::timeout(stream_timeout, produce).await.is_err() {
                warn!(timeout_secs = stream_timeout.as_secs(), "LLM stream hit total deadline");
                let _ = tx
                    .send(Err(LlmError::StreamTimeout(stream_timeout.as_secs())))
                    .await;
            }
        });

        Ok(rx)
    }
}
