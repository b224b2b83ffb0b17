//! OpenAI-compatible chat completion client (LM Studio, vLLM, OpenAI)

use super::{ChatBackend, CompletionRequest, LlmError, TextStream};
use crate::config::ModelConfig;
use crate::context::ChatMessage;
use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

static THINK_BLOCK: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").ok());

/// Remove `<think>...</think>` reasoning blocks and surrounding whitespace
pub fn strip_think_tags(text: &str) -> String {
    match THINK_BLOCK.as_ref() {
        Some(pattern) => pattern.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Chat client for one configured model
pub struct OpenAiCompatibleClient {
    client: Client,
    config: ModelConfig,
    disable_thinking: bool,
}

impl OpenAiCompatibleClient {
    /// Create a new client for the given model
    pub fn new(config: ModelConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| LlmError::Initialization(e.to_string()))?;

        Ok(Self {
            client,
            config,
            disable_thinking: false,
        })
    }

    /// Ask template-aware servers to skip reasoning output
    pub fn with_thinking_disabled(mut self) -> Self {
        self.disable_thinking = true;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn body(&self, request: CompletionRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: request.messages,
            max_tokens: request.max_tokens.or(Some(self.config.max_tokens)),
            temperature: request.temperature.or(Some(self.config.temperature)),
            stream,
            chat_template_kwargs: self
                .disable_thinking
                .then_some(TemplateKwargs { enable_thinking: false }),
        }
    }

    async fn send(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response, LlmError> {
        let mut req = self.client.post(self.endpoint()).json(body);
        // Streams are bounded by the caller's idle timeout instead
        if !body.stream {
            req = req.timeout(self.config.timeout());
        }

        if let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(api_key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("HTTP {}: {}", status, body)));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatibleClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        debug!(
            "Completion request: model={}, messages={}",
            self.config.model,
            request.messages.len()
        );

        let body = self.body(request, false);
        let response = self.send(&body).await?;

        let parsed = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))?;

        Ok(strip_think_tags(&content))
    }

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream, LlmError> {
        debug!(
            "Streaming request: model={}, messages={}",
            self.config.model,
            request.messages.len()
        );

        let body = self.body(request, true);
        let response = self.send(&body).await?;

        let mut bytes = response.bytes_stream();
        let stream = channel_stream(move |tx| async move {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                // Events are newline-delimited; a partial line (or UTF-8 sequence) waits for more bytes
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if !forward(&tx, parse_sse_line(String::from_utf8_lossy(&line).trim())).await {
                        return;
                    }
                }
            }

            let tail = parse_sse_line(String::from_utf8_lossy(&buffer).trim());
            if !forward(&tx, tail).await {
                return;
            }
            // Upstream closed without the terminator: the reply may be truncated
            let _ = tx
                .send(Err(LlmError::Stream("stream ended before [DONE]".to_string())))
                .await;
        });

        Ok(stream)
    }
}

/// Run `producer` on its own task and expose what it sends as a stream.
///
/// The producer stops at its next send once the consumer is dropped.
fn channel_stream<F, Fut>(producer: F) -> TextStream
where
    F: FnOnce(tokio::sync::mpsc::Sender<Result<String, LlmError>>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(producer(tx));
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
}

enum SseLine {
    Delta(String),
    Failed(String),
    Done,
    Skip,
}

/// Send one parsed event downstream; `false` once the stream is finished
async fn forward(tx: &tokio::sync::mpsc::Sender<Result<String, LlmError>>, event: SseLine) -> bool {
    match event {
        SseLine::Delta(text) => tx.send(Ok(text)).await.is_ok(),
        SseLine::Failed(message) => {
            warn!("Model backend reported a stream error: {}", message);
            let _ = tx.send(Err(LlmError::Stream(message))).await;
            false
        }
        SseLine::Done => false,
        SseLine::Skip => true,
    }
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(ChatCompletionChunk {
            error: Some(error), ..
        }) => SseLine::Failed(error.describe()),
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|text| !text.is_empty())
            .map(SseLine::Delta)
            .unwrap_or(SseLine::Skip),
        Err(e) => {
            warn!("Skipping malformed stream event: {}", e);
            SseLine::Skip
        }
    }
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_template_kwargs: Option<TemplateKwargs>,
}

#[derive(Debug, Serialize)]
struct TemplateKwargs {
    enable_thinking: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

/// In-band error payload; servers send either an object or a bare string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamErrorBody {
    Detailed { message: Option<String> },
    Message(String),
}

impl StreamErrorBody {
    fn describe(self) -> String {
        match self {
            StreamErrorBody::Detailed { message: Some(message) } => message,
            StreamErrorBody::Detailed { message: None } => "model backend reported an error".to_string(),
            StreamErrorBody::Message(message) => message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}
