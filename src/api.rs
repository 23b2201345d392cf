use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

use crate::models::Role;
use crate::registry::{ModelConfig, Provider};

/// One increment of a streamed reply.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Reasoning(String),
    /// Metered token counts, usually in the final chunk.
    Usage { input_tokens: u64, output_tokens: u64 },
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// One history entry as sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Everything needed to open one completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: ModelConfig,
    pub api_key: String,
    pub messages: Vec<ChatMessage>,
}

// Interface for LLM API providers
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    /// Opens a streaming completion and returns its deltas.
    async fn send_chat_stream_request(&self, request: ChatRequest) -> Result<DeltaStream>;
}

/// Base URLs of the OpenAI-compatible APIs, with optional per-provider overrides.
#[derive(Debug, Clone, Default)]
pub struct ProviderEndpoints {
    overrides: HashMap<Provider, String>,
}

impl ProviderEndpoints {
    pub fn with_override(mut self, provider: Provider, base_url: impl Into<String>) -> Self {
        self.overrides.insert(provider, base_url.into());
        self
    }

    pub fn base_url(&self, provider: Provider) -> &str {
        self.overrides
            .get(&provider)
            .map(String::as_str)
            .unwrap_or_else(|| provider.default_base_url())
    }

    pub fn completions_url(&self, provider: Provider) -> String {
        format!("{}/chat/completions", self.base_url(provider).trim_end_matches('/'))
    }
}

// --- OpenAI Compatible Provider Implementation ---

#[derive(Serialize, Debug)]
struct CompletionRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize, Debug)]
struct StreamOptions {
    include_usage: bool,
}

// Response structure for streaming chunks
#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: ChoiceDelta,
}

#[derive(Deserialize, Debug, Default)]
struct ChoiceDelta {
    content: Option<String>,
    // OpenRouter names it `reasoning`, DeepSeek `reasoning_content`
    reasoning: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

// Response structure for non-streaming completions
#[derive(Deserialize, Debug)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize, Debug)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Decodes the data field of one SSE event into zero or more deltas.
///
/// `[DONE]` and keep-alive pings decode to nothing; an `error` payload becomes an `Err`.
pub fn parse_stream_event(data: &str) -> Result<Vec<StreamDelta>> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data == "[DONE]" {
        log::info!("Stream finished with [DONE]");
        return Ok(Vec::new());
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let mut deltas = Vec::new();
            if let Some(choice) = chunk.choices.into_iter().next() {
                let delta = choice.delta;
                if let Some(reasoning) = delta.reasoning.or(delta.reasoning_content) {
                    if !reasoning.is_empty() {
                        deltas.push(StreamDelta::Reasoning(reasoning));
                    }
                }
                if let Some(content) = delta.content {
                    if !content.is_empty() {
                        deltas.push(StreamDelta::Text(content));
                    }
                }
            }
            if let Some(usage) = chunk.usage {
                deltas.push(StreamDelta::Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                });
            }
            Ok(deltas)
        }
        Err(e) => {
            // Not a completion chunk. Check for events we know how to handle.
            let value: serde_json::Value = serde_json::from_str(data).map_err(|_| {
                log::warn!("Failed to parse stream chunk as JSON: {} - Data: {}", e, data);
                anyhow::Error::from(e).context(format!("Failed to parse stream chunk as JSON: {}", data))
            })?;

            if value.get("type").and_then(|t| t.as_str()) == Some("ping") {
                log::debug!("Received stream ping event, skipping.");
                return Ok(Vec::new());
            }
            if let Some(error) = value.get("error") {
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                log::error!("Provider reported an error mid-stream: {}", message);
                return Err(anyhow::anyhow!("Provider error: {}", message));
            }

            log::warn!("Unrecognised stream event: {}", data);
            Err(anyhow::anyhow!("Parsed as JSON but not a valid stream chunk: {}", data))
        }
    }
}

pub struct OpenAICompatibleProvider {
    client: Client,
    endpoints: ProviderEndpoints,
}

impl OpenAICompatibleProvider {
    pub fn new(endpoints: ProviderEndpoints) -> Self {
        Self {
            client: Client::new(),
            endpoints,
        }
    }

    async fn post(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let url = self.endpoints.completions_url(request.model.provider);
        log::info!(
            "Sending {} request to {} using model: {}",
            if stream { "stream" } else { "completion" },
            url,
            request.model.model_id
        );

        let body = CompletionRequestBody {
            model: &request.model.model_id,
            messages: &request.messages,
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&request.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", request.model.provider))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("{} request failed with status {}: {}", request.model.provider, status, error_body);
            return Err(anyhow::anyhow!("API request failed with status {}: {}", status, error_body));
        }
        Ok(response)
    }

    /// Single-shot completion; returns the reply text.
    pub async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let response = self.post(request, false).await?;
        let body: CompletionResponse = response
            .json()
            .await
            .context("Failed to decode completion response")?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .context("Completion response contained no message")
    }
}

#[async_trait]
impl LLMApiProvider for OpenAICompatibleProvider {
    async fn send_chat_stream_request(&self, request: ChatRequest) -> Result<DeltaStream> {
        let response = self.post(&request, true).await?;

        let deltas = response.bytes_stream().eventsource().flat_map(|event| {
            let items: Vec<Result<StreamDelta>> = match event.context("Error reading stream event") {
                Ok(event) => match parse_stream_event(&event.data) {
                    Ok(deltas) => deltas.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                },
                Err(e) => {
                    log::error!("Error processing stream chunk: {:?}", e);
                    vec![Err(e)]
                }
            };
            stream::iter(items)
        });

        Ok(Box::pin(deltas))
    }
}
