//! Shared test doubles: a scripted model backend, a counting store wrapper and
//! an orchestrator harness over the in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chat_orchestrator::chat::{ChatOrchestrator, OrchestratorSettings, ServerEvent, Session};
use chat_orchestrator::context::{
    CompressionEngine, CompressionSettings, Conversation, ConversationId, LlmSummarizer, NewTurn,
    Role, Summarizer, SummarizerConfig, TokenCounter, Turn, TurnId, UserId, WordBasedEstimator,
};
use chat_orchestrator::llm::{ChatBackend, CompletionRequest, Labeler, LlmError, TextStream};
use chat_orchestrator::speech::{SpeechError, Synthesizer, Transcriber};
use chat_orchestrator::store::{ConversationStore, InMemoryStore, StoreError};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How one streaming call behaves
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// Yield the chunks, then end
    Chunks(Vec<&'static str>),
    /// Yield the chunks, then fail
    FailAfter(Vec<&'static str>),
    /// Yield the chunks, then never produce anything again
    HangAfter(Vec<&'static str>),
    /// Yield each chunk after a pause
    Slow(Vec<&'static str>, Duration),
    /// Refuse to open the stream
    Refuse,
}

/// Model backend that replays scripted answers and records every request
#[derive(Default)]
pub struct ScriptedBackend {
    completions: Mutex<VecDeque<Result<String, LlmError>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    pub complete_requests: Mutex<Vec<CompletionRequest>>,
    pub stream_requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_completion(&self, reply: impl Into<String>) {
        self.completions.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn push_completion_error(&self) {
        self.completions
            .lock()
            .unwrap()
            .push_back(Err(LlmError::Api("HTTP 500: scripted".to_string())));
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn completion_calls(&self) -> usize {
        self.complete_requests.lock().unwrap().len()
    }

    pub fn last_stream_request(&self) -> Option<CompletionRequest> {
        self.stream_requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        self.complete_requests.lock().unwrap().push(request);
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("scripted reply".to_string()))
    }

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream, LlmError> {
        self.stream_requests.lock().unwrap().push(request);
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StreamScript::Chunks(vec!["Hello", " there"]));

        let ok = |chunks: Vec<&'static str>| {
            futures::stream::iter(chunks.into_iter().map(|c| Ok(c.to_string())))
        };
        Ok(match script {
            StreamScript::Chunks(chunks) => ok(chunks).boxed(),
            StreamScript::FailAfter(chunks) => ok(chunks)
                .chain(futures::stream::once(async {
                    Err(LlmError::Stream("connection reset".to_string()))
                }))
                .boxed(),
            StreamScript::HangAfter(chunks) => ok(chunks).chain(futures::stream::pending()).boxed(),
            StreamScript::Slow(chunks, pause) => futures::stream::iter(chunks)
                .then(move |c| async move {
                    tokio::time::sleep(pause).await;
                    Ok(c.to_string())
                })
                .boxed(),
            StreamScript::Refuse => return Err(LlmError::Network("refused".to_string())),
        })
    }
}

/// Store wrapper counting turn reads and writes
pub struct CountingStore {
    inner: InMemoryStore,
    pub turn_reads: AtomicUsize,
    pub turn_writes: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            turn_reads: AtomicUsize::new(0),
            turn_writes: AtomicUsize::new(0),
        })
    }

    pub fn reads(&self) -> usize {
        self.turn_reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.turn_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationStore for CountingStore {
    async fn create_conversation(&self, owner_id: UserId, title: &str) -> Result<Conversation, StoreError> {
        self.inner.create_conversation(owner_id, title).await
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.inner.get_conversation(id).await
    }

    async fn list_conversations(&self, owner_id: UserId) -> Result<Vec<Conversation>, StoreError> {
        self.inner.list_conversations(owner_id).await
    }

    async fn list_turns(&self, conversation_id: ConversationId) -> Result<Vec<Turn>, StoreError> {
        self.turn_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.list_turns(conversation_id).await
    }

    async fn append_turn(&self, conversation_id: ConversationId, turn: NewTurn) -> Result<Turn, StoreError> {
        self.turn_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.append_turn(conversation_id, turn).await
    }

    async fn delete_turn(&self, id: TurnId) -> Result<(), StoreError> {
        self.turn_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_turn(id).await
    }

    async fn delete_conversation(&self, id: ConversationId, owner_id: UserId) -> Result<bool, StoreError> {
        self.turn_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_conversation(id, owner_id).await
    }

    async fn set_title(&self, conversation_id: ConversationId, title: &str) -> Result<(), StoreError> {
        self.inner.set_title(conversation_id, title).await
    }

    async fn set_digest(
        &self,
        conversation_id: ConversationId,
        summary: &str,
        tags: &[String],
    ) -> Result<(), StoreError> {
        self.inner.set_digest(conversation_id, summary, tags).await
    }

    async fn apply_compression(
        &self,
        conversation_id: ConversationId,
        context_summary: &str,
        removed: &[TurnId],
    ) -> Result<(), StoreError> {
        self.turn_writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .apply_compression(conversation_id, context_summary, removed)
            .await
    }
}

pub struct FixedTranscriber(pub Result<&'static str, ()>);

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _audio: Bytes) -> Result<String, SpeechError> {
        self.0
            .map(str::to_string)
            .map_err(|_| SpeechError::Transcription("engine down".to_string()))
    }
}

pub struct FixedSynthesizer(pub bool);

#[async_trait]
impl Synthesizer for FixedSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<Bytes, SpeechError> {
        if self.0 {
            Ok(Bytes::from_static(b"RIFFdata"))
        } else {
            Err(SpeechError::Synthesis("engine down".to_string()))
        }
    }

    fn format(&self) -> &str {
        "wav"
    }
}

/// Counter where every word is one token, so budgets are easy to reason about
pub fn word_counter() -> TokenCounter {
    TokenCounter::new(Arc::new(WordBasedEstimator::new(1.0)))
}

pub struct Harness {
    pub store: Arc<CountingStore>,
    pub chat: Arc<ScriptedBackend>,
    pub summary: Arc<ScriptedBackend>,
    pub orchestrator: Arc<ChatOrchestrator>,
}

pub struct HarnessOptions {
    pub compression: CompressionSettings,
    pub system_prompt: String,
    pub idle_timeout: Duration,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            compression: CompressionSettings {
                max_tokens: 10_000,
                threshold: 0.8,
                keep_recent: 4,
            },
            system_prompt: String::new(),
            idle_timeout: Duration::from_secs(5),
            transcriber: None,
            synthesizer: None,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let store = CountingStore::new();
        let chat = ScriptedBackend::new();
        let summary = ScriptedBackend::new();

        let summarizer: Arc<dyn Summarizer> = Arc::new(LlmSummarizer::new(
            summary.clone(),
            SummarizerConfig::default(),
        ));
        let compression = Arc::new(CompressionEngine::new(
            word_counter(),
            Arc::clone(&summarizer),
            options.compression,
        ));
        let labeler = Labeler::new(summary.clone(), "Tags:");

        let orchestrator = ChatOrchestrator::new(
            store.clone(),
            chat.clone(),
            compression,
            summarizer,
            labeler,
            OrchestratorSettings {
                system_prompt: options.system_prompt,
                stream_idle_timeout: options.idle_timeout,
            },
        )
        .with_speech(options.transcriber, options.synthesizer);

        Self {
            store,
            chat,
            summary,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Conversation with a non-default title, so no title task is spawned
    pub async fn conversation(&self, owner: UserId) -> Conversation {
        self.store
            .create_conversation(owner, "Existing chat")
            .await
            .unwrap()
    }

    pub async fn seed(&self, conversation_id: ConversationId, contents: &[&str]) {
        for (i, content) in contents.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let tokens = word_counter().count(content);
            self.store
                .append_turn(conversation_id, NewTurn::new(role, *content, tokens))
                .await
                .unwrap();
        }
    }

    pub async fn turns(&self, conversation_id: ConversationId) -> Vec<Turn> {
        self.store.inner.list_turns(conversation_id).await.unwrap()
    }
}

/// A registered-looking session and the receiving end of its event queue
pub fn session(conversation_id: ConversationId, user_id: UserId) -> (Session, mpsc::Receiver<ServerEvent>) {
    let (tx, rx) = mpsc::channel(256);
    (Session::new(conversation_id, user_id, tx), rx)
}

/// Everything queued so far
pub fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Short type names for order assertions
pub fn kinds(events: &[ServerEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            ServerEvent::Status { .. } => "status",
            ServerEvent::Transcription { .. } => "transcription",
            ServerEvent::UserMessage { .. } => "user_message",
            ServerEvent::AssistantChunk { .. } => "assistant_chunk",
            ServerEvent::AssistantAudio { .. } => "assistant_audio",
            ServerEvent::AssistantComplete { .. } => "assistant_complete",
            ServerEvent::Error { .. } => "error",
        })
        .collect()
}
