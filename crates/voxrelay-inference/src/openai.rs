//! OpenAI Chat Completions reasoning backend.
//!
//! Streams replies from `/v1/chat/completions`. Also serves OpenRouter,
//! Ollama and other OpenAI-compatible endpoints.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use voxrelay_core::config::StageConfig;
use voxrelay_core::protocol::StageKind;

use crate::link::{StageBackend, StreamIo};
use crate::sse::parse_sse_stream;
use crate::{ReasoningEvent, ReasoningInput};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";
const MAX_TOKENS: u32 = 300;
/// Messages of prior turns kept as context, user and assistant counted separately.
const MAX_HISTORY: usize = 20;

/// API style. Determines auth and a few headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

impl ApiStyle {
    pub fn from_provider(provider: &str) -> Option<Self> {
        match provider {
            "openai" => Some(Self::OpenAi),
            "openrouter" => Some(Self::OpenRouter),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => OPENAI_BASE_URL,
            Self::OpenRouter => OPENROUTER_BASE_URL,
            Self::Ollama => OLLAMA_BASE_URL,
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Self::Ollama => DEFAULT_OLLAMA_MODEL,
            _ => DEFAULT_OPENAI_MODEL,
        }
    }

    fn requires_key(self) -> bool {
        self != Self::Ollama
    }
}

pub struct OpenAiReasoner {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    api_key: Option<String>,
    model: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
    /// Conversation so far, oldest first.
    history: Mutex<VecDeque<serde_json::Value>>,
}

impl OpenAiReasoner {
    pub fn new(style: ApiStyle, config: &StageConfig, system_prompt: Option<&str>) -> anyhow::Result<Self> {
        let api_key = config.resolve_api_key();
        if style.requires_key() && api_key.is_none() {
            anyhow::bail!("{} reasoning requires an API key", config.provider);
        }
        Ok(Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(style.default_base_url())
                .trim_end_matches('/')
                .to_string(),
            api_style: style,
            provider_id: config.provider.clone(),
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| style.default_model().to_string()),
            system_prompt: system_prompt.map(str::to_string),
            client: reqwest::Client::new(),
            history: Mutex::new(VecDeque::new()),
        })
    }

    fn messages(&self, prompt: &str) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        messages.extend(history.iter().cloned());
        messages.push(json!({ "role": "user", "content": prompt }));
        messages
    }

    fn remember(&self, prompt: &str, reply: &str) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(json!({ "role": "user", "content": prompt }));
        if !reply.is_empty() {
            history.push_back(json!({ "role": "assistant", "content": reply }));
        }
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    async fn open_stream(&self, prompt: &str) -> anyhow::Result<reqwest::Response> {
        let body = OpenAiRequest {
            model: self.model.clone(),
            messages: self.messages(prompt),
            max_tokens: MAX_TOKENS,
            stream: true,
            temperature: None,
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming chat completion");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(key) = &self.api_key {
            if self.api_style != ApiStyle::Ollama {
                req_builder = req_builder.header("authorization", format!("Bearer {key}"));
            }
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("X-Title", "voxrelay");
        }

        let response = req_builder.json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} API error {status}: {body}", self.provider_id);
        }
        Ok(response)
    }

    /// Stream one turn. `Ok(false)` once the router is gone.
    async fn respond(
        &self,
        io: &mut StreamIo<'_, ReasoningInput, ReasoningEvent>,
        turn: u64,
        prompt: &str,
    ) -> anyhow::Result<bool> {
        let request = self.open_stream(prompt);
        tokio::pin!(request);
        let response = loop {
            tokio::select! {
                response = &mut request => break response?,
                interrupt = io.recv_interrupt() => match interrupt {
                    Some(ReasoningInput::Cancel { turn: cancelled }) => {
                        if !io.emit(ReasoningEvent::Cancelled { turn: cancelled }).await {
                            return Ok(false);
                        }
                        if cancelled == turn {
                            self.remember(prompt, "");
                            return Ok(true);
                        }
                    }
                    Some(next @ ReasoningInput::Prompt { .. }) => io.defer(next),
                    None => return Ok(false),
                },
            }
        };

        let sse = parse_sse_stream(response.bytes_stream());
        tokio::pin!(sse);
        let mut reply = String::new();

        loop {
            tokio::select! {
                event = sse.next() => match event {
                    Some(Ok(event)) => {
                        let data = event.data.trim();
                        if data == "[DONE]" {
                            break;
                        }
                        let Some(delta) = parse_delta(data) else {
                            continue;
                        };
                        reply.push_str(&delta);
                        if !io.emit(ReasoningEvent::Token { turn, text: delta }).await {
                            return Ok(false);
                        }
                    }
                    Some(Err(e)) => {
                        if reply.is_empty() {
                            return Err(e);
                        }
                        // Tokens already went out; close the turn before failing.
                        warn!(turn, error = %e, "Reasoning stream broke mid-turn");
                        self.remember(prompt, &reply);
                        io.emit(ReasoningEvent::EndOfTurn { turn }).await;
                        return Err(e);
                    }
                    None => break,
                },
                interrupt = io.recv_interrupt() => match interrupt {
                    Some(ReasoningInput::Cancel { turn: cancelled }) => {
                        if !io.emit(ReasoningEvent::Cancelled { turn: cancelled }).await {
                            return Ok(false);
                        }
                        if cancelled == turn {
                            debug!(turn, chars = reply.len(), "Turn cancelled");
                            self.remember(prompt, &reply);
                            return Ok(true);
                        }
                    }
                    Some(next @ ReasoningInput::Prompt { .. }) => io.defer(next),
                    None => return Ok(false),
                },
            }
        }

        self.remember(prompt, &reply);
        Ok(io.emit(ReasoningEvent::EndOfTurn { turn }).await)
    }
}

#[async_trait]
impl StageBackend<ReasoningInput, ReasoningEvent> for OpenAiReasoner {
    fn kind(&self) -> StageKind {
        StageKind::Reasoning
    }

    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn run(&self, io: &mut StreamIo<'_, ReasoningInput, ReasoningEvent>) -> anyhow::Result<()> {
        while let Some(item) = io.recv().await {
            let delivered = match item {
                ReasoningInput::Prompt { turn, text } => self.respond(io, turn, &text).await?,
                ReasoningInput::Cancel { turn } => io.emit(ReasoningEvent::Cancelled { turn }).await,
            };
            if !delivered {
                break;
            }
            io.complete();
        }
        Ok(())
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Text carried by one streamed chunk, if any.
fn parse_delta(data: &str) -> Option<String> {
    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            trace!(%e, data, "Failed to parse completion chunk");
            return None;
        }
    };
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
}
