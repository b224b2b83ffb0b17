//! Per-turn state machine shared by the request/response and duplex transports
//!
//! ```text
//! RECEIVED -> PERSISTED_USER -> COMPRESSING -> WINDOW_BUILT -> STREAMING
//!          -> PERSISTED_ASSISTANT -> COMPLETE        (ERRORED from any step)
//! ```
//!
//! Steps from persisting the user turn to persisting the assistant turn run
//! under the conversation's lock. Store calls are scoped to single operations
//! and never span the model stream.

use super::events::{MessageView, ServerEvent, TurnStatus};
use super::locks::ConversationLocks;
use super::registry::{Session, SessionId, SessionRegistry};
use crate::context::{
    build_window, render_transcript, ChatMessage, CompressionEngine, Conversation, ConversationId,
    NewTurn, Role, Summarizer, Turn, UserId, DEFAULT_TITLE,
};
use crate::error::{Error, Result};
use crate::llm::{ChatBackend, CompletionRequest, Labeler, LlmError};
use crate::metrics::METRICS;
use crate::speech::{SpeechError, Synthesizer, Transcriber};
use crate::store::ConversationStore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Steps of one user turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    Received,
    PersistedUser,
    Compressing,
    WindowBuilt,
    Streaming,
    PersistedAssistant,
    Complete,
    Errored,
}

/// Result of a request/response turn
#[derive(Debug, Clone, Serialize)]
pub struct ChatExchange {
    pub message: MessageView,
    pub assistant_message: MessageView,
}

/// A conversation with its full history, for download
#[derive(Debug, Clone)]
pub struct ConversationExport {
    pub conversation: Conversation,
    pub turns: Vec<Turn>,
}

impl ConversationExport {
    /// Readable transcript with the title, tags and summary as a header
    pub fn to_markdown(&self) -> String {
        let conversation = &self.conversation;
        let mut out = format!("# {}\n\n", conversation.title);
        out.push_str(&format!("**Created**: {}\n\n", conversation.created_at.to_rfc3339()));
        if !conversation.tags.is_empty() {
            out.push_str(&format!("**Tags**: {}\n\n", conversation.tags.join(", ")));
        }
        if let Some(summary) = conversation.summary.as_deref() {
            out.push_str(&format!("**Summary**: {}\n\n", summary));
        }
        out.push_str("---\n\n");

        for turn in &self.turns {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            out.push_str(&format!("### {}\n\n{}\n\n", speaker, turn.content));
        }
        out
    }

    pub fn filename(&self, extension: &str) -> String {
        let stem: String = self
            .conversation
            .title
            .chars()
            .map(|c| if c.is_alphanumeric() || c == ' ' || c == '-' { c } else { '_' })
            .collect();
        let stem = stem.trim();
        if stem.is_empty() {
            format!("conversation-{}.{}", self.conversation.id, extension)
        } else {
            format!("{}.{}", stem, extension)
        }
    }
}

/// Synthesized reply audio
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub audio: Bytes,
    pub format: String,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub system_prompt: String,
    pub stream_idle_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            stream_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Where a turn's events go
#[derive(Clone, Copy)]
enum Transport<'a> {
    /// Accumulate silently; fan out persisted turns to live sessions
    Request,
    /// Relay every event to the originating session
    Duplex { session: &'a Session, voice: bool },
}

impl Transport<'_> {
    fn label(&self) -> &'static str {
        match self {
            Transport::Request => "request",
            Transport::Duplex { voice: false, .. } => "duplex",
            Transport::Duplex { voice: true, .. } => "voice",
        }
    }

    fn session_id(&self) -> Option<SessionId> {
        match self {
            Transport::Request => None,
            Transport::Duplex { session, .. } => Some(session.id),
        }
    }
}

/// Drives user turns through persistence, compression and streaming
pub struct ChatOrchestrator {
    store: Arc<dyn ConversationStore>,
    backend: Arc<dyn ChatBackend>,
    compression: Arc<CompressionEngine>,
    summarizer: Arc<dyn Summarizer>,
    labeler: Labeler,
    transcriber: Option<Arc<dyn Transcriber>>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    registry: SessionRegistry,
    locks: ConversationLocks,
    settings: OrchestratorSettings,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        backend: Arc<dyn ChatBackend>,
        compression: Arc<CompressionEngine>,
        summarizer: Arc<dyn Summarizer>,
        labeler: Labeler,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            backend,
            compression,
            summarizer,
            labeler,
            transcriber: None,
            synthesizer: None,
            registry: SessionRegistry::new(),
            locks: ConversationLocks::new(),
            settings,
        }
    }

    pub fn with_speech(
        mut self,
        transcriber: Option<Arc<dyn Transcriber>>,
        synthesizer: Option<Arc<dyn Synthesizer>>,
    ) -> Self {
        self.transcriber = transcriber;
        self.synthesizer = synthesizer;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    // --- conversations ---

    pub async fn create_conversation(&self, owner: UserId, title: Option<&str>) -> Result<Conversation> {
        let title = title.map(str::trim).filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TITLE);
        Ok(self.store.create_conversation(owner, title).await?)
    }

    pub async fn list_conversations(&self, owner: UserId) -> Result<Vec<Conversation>> {
        Ok(self.store.list_conversations(owner).await?)
    }

    /// The conversation if `owner` may use it; missing and foreign look the same
    pub async fn authorize(&self, owner: UserId, conversation_id: ConversationId) -> Result<Conversation> {
        self.store
            .get_owned_conversation(conversation_id, owner)
            .await?
            .ok_or(Error::ConversationNotFound(conversation_id))
    }

    pub async fn list_messages(&self, owner: UserId, conversation_id: ConversationId) -> Result<Vec<Turn>> {
        self.authorize(owner, conversation_id).await?;
        Ok(self.store.list_turns(conversation_id).await?)
    }

    pub async fn rename_conversation(
        &self,
        owner: UserId,
        conversation_id: ConversationId,
        title: &str,
    ) -> Result<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::EmptyTitle);
        }
        self.authorize(owner, conversation_id).await?;
        self.store.set_title(conversation_id, title).await?;
        self.authorize(owner, conversation_id).await
    }

    /// Delete a conversation and everything in it.
    ///
    /// Waits for an in-flight turn to finish so no turn lands after the delete.
    pub async fn delete_conversation(&self, owner: UserId, conversation_id: ConversationId) -> Result<()> {
        let _guard = self.locks.acquire(conversation_id).await;
        if !self.store.delete_conversation(conversation_id, owner).await? {
            return Err(Error::ConversationNotFound(conversation_id));
        }
        info!("User {} deleted conversation {}", owner, conversation_id);
        Ok(())
    }

    /// Delete every listed conversation `owner` has; others are skipped. Returns how many went.
    pub async fn delete_conversations(&self, owner: UserId, ids: &[ConversationId]) -> Result<usize> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut deleted = 0;
        for conversation_id in ids {
            let _guard = self.locks.acquire(conversation_id).await;
            if self.store.delete_conversation(conversation_id, owner).await? {
                deleted += 1;
            }
        }
        info!("User {} deleted {} conversations", owner, deleted);
        Ok(deleted)
    }

    pub async fn export_conversation(
        &self,
        owner: UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationExport> {
        let conversation = self.authorize(owner, conversation_id).await?;
        let turns = self.store.list_turns(conversation_id).await?;
        Ok(ConversationExport { conversation, turns })
    }

    // --- turns ---

    /// Request/response turn: returns both persisted turns or an error with nothing half-written
    pub async fn send_message(
        &self,
        owner: UserId,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<ChatExchange> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::EmptyMessage);
        }
        self.authorize(owner, conversation_id).await?;

        let started = Instant::now();
        let result = self
            .process_turn(
                conversation_id,
                content.to_string(),
                Transport::Request,
                &CancellationToken::new(),
            )
            .await;
        self.finish_turn(conversation_id, Transport::Request, started, &result);

        let (user, assistant) = result?;
        Ok(ChatExchange {
            message: MessageView::from(&user),
            assistant_message: MessageView::from(&assistant),
        })
    }

    /// Duplex text turn. Blank input is ignored; failures become one `error` event.
    pub async fn run_turn(&self, session: &Session, content: &str, cancel: &CancellationToken) {
        let content = content.trim();
        if content.is_empty() {
            debug!("Ignoring empty message on session {}", session.id);
            return;
        }

        let transport = Transport::Duplex {
            session,
            voice: false,
        };
        let started = Instant::now();
        let result = self
            .process_turn(session.conversation_id, content.to_string(), transport, cancel)
            .await;
        self.finish_turn(session.conversation_id, transport, started, &result);

        if let Err(e) = result {
            self.report(session, &e).await;
        }
    }

    /// Duplex voice turn: transcribe, run the shared flow, then attach audio.
    /// An empty payload is ignored like blank text.
    pub async fn run_voice_turn(&self, session: &Session, audio_b64: &str, cancel: &CancellationToken) {
        let audio_b64 = audio_b64.trim();
        if audio_b64.is_empty() {
            debug!("Ignoring empty audio on session {}", session.id);
            return;
        }

        let transport = Transport::Duplex { session, voice: true };
        let started = Instant::now();

        let result = self.voice_turn(session, audio_b64, transport, cancel).await;
        self.finish_turn(session.conversation_id, transport, started, &result);

        if let Err(e) = result {
            self.report(session, &e).await;
        }
    }

    async fn voice_turn(
        &self,
        session: &Session,
        audio_b64: &str,
        transport: Transport<'_>,
        cancel: &CancellationToken,
    ) -> Result<(Turn, Turn)> {
        session
            .emit(ServerEvent::Status {
                status: TurnStatus::Transcribing,
            })
            .await;

        let audio = BASE64
            .decode(audio_b64)
            .map_err(|e| Error::InvalidAudio(e.to_string()))?;

        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            text = self.transcribe(Bytes::from(audio)) => text?,
        };
        if text.trim().is_empty() {
            return Err(Error::NoSpeech);
        }
        session
            .emit(ServerEvent::Transcription { text: text.clone() })
            .await;

        let (user, assistant) = self
            .process_turn(session.conversation_id, text, transport, cancel)
            .await?;

        Ok((user, assistant))
    }

    async fn process_turn(
        &self,
        conversation_id: ConversationId,
        content: String,
        transport: Transport<'_>,
        cancel: &CancellationToken,
    ) -> Result<(Turn, Turn)> {
        let mut stage = TurnStage::Received;
        let result = self
            .drive_turn(conversation_id, content, transport, cancel, &mut stage)
            .await;

        match &result {
            Ok(_) => debug!("Conversation {} turn reached {:?}", conversation_id, TurnStage::Complete),
            Err(Error::Cancelled) => {
                info!("Conversation {} turn cancelled during {:?}", conversation_id, stage)
            }
            Err(e) => error!(
                "Conversation {} turn {:?} at {:?}: {}",
                conversation_id,
                TurnStage::Errored,
                stage,
                e
            ),
        }
        result
    }

    async fn drive_turn(
        &self,
        conversation_id: ConversationId,
        content: String,
        transport: Transport<'_>,
        cancel: &CancellationToken,
        stage: &mut TurnStage,
    ) -> Result<(Turn, Turn)> {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.locks.acquire(conversation_id) => guard,
        };

        // Re-read under the lock: the conversation may have been removed meanwhile
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(Error::ConversationNotFound(conversation_id))?;

        let counter = self.compression.counter();
        let user_turn = self
            .store
            .append_turn(
                conversation_id,
                NewTurn::new(Role::User, content.as_str(), counter.count(&content)),
            )
            .await?;
        *stage = TurnStage::PersistedUser;
        self.publish(
            transport,
            conversation_id,
            ServerEvent::UserMessage {
                message: MessageView::from(&user_turn),
            },
        )
        .await;

        if conversation.has_default_title() && self.store.count_turns(conversation_id).await? == 1 {
            self.spawn_title(conversation_id, content);
        }

        *stage = TurnStage::Compressing;
        self.compression
            .maybe_compress(self.store.as_ref(), conversation_id, self.system_prompt())
            .await;

        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(Error::ConversationNotFound(conversation_id))?;
        let turns = self.store.list_turns(conversation_id).await?;
        let window = build_window(&turns, conversation.stored_summary(), self.system_prompt());
        METRICS.record_window(counter.count_batch(&window));
        *stage = TurnStage::WindowBuilt;

        if let Transport::Duplex { session, voice: true } = transport {
            session
                .emit(ServerEvent::Status {
                    status: TurnStatus::Thinking,
                })
                .await;
        }

        *stage = TurnStage::Streaming;
        let reply = self.stream_reply(window, transport, cancel).await?;

        // Last chance to abandon: nothing of this reply has been persisted yet
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let assistant_turn = self
            .store
            .append_turn(
                conversation_id,
                NewTurn::new(Role::Assistant, reply.as_str(), counter.count(&reply)),
            )
            .await?;
        *stage = TurnStage::PersistedAssistant;
        drop(guard);

        if let Transport::Duplex { session, voice: true } = transport {
            self.attach_audio(session, &reply).await;
        }

        self.publish(
            transport,
            conversation_id,
            ServerEvent::AssistantComplete {
                message: MessageView::from(&assistant_turn),
            },
        )
        .await;
        *stage = TurnStage::Complete;

        Ok((user_turn, assistant_turn))
    }

    async fn stream_reply(
        &self,
        window: Vec<ChatMessage>,
        transport: Transport<'_>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let idle = self.settings.stream_idle_timeout;
        let idle_secs = idle.as_secs();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            opened = tokio::time::timeout(idle, self.backend.stream(CompletionRequest::new(window))) => {
                opened.map_err(|_| Error::StreamTimeout(idle_secs))??
            }
        };

        let mut reply = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = tokio::time::timeout(idle, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => return Err(Error::StreamTimeout(idle_secs)),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(chunk))) => chunk,
            };

            METRICS.record_chunk();
            reply.push_str(&chunk);
            if let Transport::Duplex { session, .. } = transport {
                if !session.emit(ServerEvent::AssistantChunk { content: chunk }).await {
                    // Writer is gone: the client disconnected
                    return Err(Error::Cancelled);
                }
            }
        }

        if reply.trim().is_empty() {
            return Err(LlmError::InvalidResponse("empty response".to_string()).into());
        }
        Ok(reply)
    }

    /// Best-effort: failures are logged and the turn completes without audio
    async fn attach_audio(&self, session: &Session, reply: &str) {
        session
            .emit(ServerEvent::Status {
                status: TurnStatus::Synthesizing,
            })
            .await;

        match self.synthesize(reply).await {
            Ok(synthesized) => {
                session
                    .emit(ServerEvent::AssistantAudio {
                        audio: BASE64.encode(&synthesized.audio),
                        format: synthesized.format,
                    })
                    .await;
            }
            Err(e) => warn!("Skipping reply audio for session {}: {}", session.id, e),
        }
    }

    async fn publish(&self, transport: Transport<'_>, conversation_id: ConversationId, event: ServerEvent) {
        if let Transport::Duplex { session, .. } = transport {
            session.emit(event.clone()).await;
        }
        self.registry
            .broadcast(conversation_id, &event, transport.session_id());
    }

    async fn report(&self, session: &Session, e: &Error) {
        if matches!(e, Error::Cancelled) {
            return;
        }
        session.emit(ServerEvent::error(e.client_message())).await;
    }

    fn finish_turn(
        &self,
        conversation_id: ConversationId,
        transport: Transport<'_>,
        started: Instant,
        result: &Result<(Turn, Turn)>,
    ) {
        let outcome = match result {
            Ok(_) => "complete",
            Err(Error::Cancelled) => {
                METRICS.record_stream_failure("cancelled");
                "cancelled"
            }
            Err(Error::StreamTimeout(_)) => {
                METRICS.record_stream_failure("timeout");
                "error"
            }
            Err(Error::Llm(_)) => {
                METRICS.record_stream_failure("backend");
                "error"
            }
            Err(e) if e.is_client_error() => "rejected",
            Err(_) => "error",
        };
        debug!(
            "Conversation {} {} turn finished: {}",
            conversation_id,
            transport.label(),
            outcome
        );
        METRICS.record_turn(transport.label(), outcome, started.elapsed().as_secs_f64());
    }

    fn system_prompt(&self) -> Option<&str> {
        Some(self.settings.system_prompt.as_str()).filter(|p| !p.trim().is_empty())
    }

    /// Fire-and-forget title generation; the outcome is logged and discarded
    fn spawn_title(&self, conversation_id: ConversationId, first_message: String) {
        let labeler = self.labeler.clone();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let result = assign_title(&labeler, store.as_ref(), conversation_id, &first_message).await;
            METRICS.record_title_generation(result.is_ok());
            match result {
                Ok(title) => debug!("Conversation {} titled {:?}", conversation_id, title),
                Err(e) => warn!("Title generation for conversation {} failed: {}", conversation_id, e),
            }
        });
    }

    // --- digest and speech ---

    /// Summarize the whole conversation (and optionally tag it) for display
    pub async fn digest(
        &self,
        owner: UserId,
        conversation_id: ConversationId,
        with_tags: bool,
    ) -> Result<Conversation> {
        let conversation = self.authorize(owner, conversation_id).await?;

        let text = {
            let _guard = self.locks.acquire(conversation_id).await;
            let turns = self.store.list_turns(conversation_id).await?;
            let transcript = render_transcript(&turns);
            match conversation.stored_summary() {
                Some(summary) if transcript.is_empty() => summary.to_string(),
                Some(summary) => format!("{}\n\n{}", summary, transcript),
                None => transcript,
            }
        };
        if text.trim().is_empty() {
            return Ok(conversation);
        }

        let summary = self.summarizer.summarize(&text).await?;
        let tags = if with_tags {
            self.labeler.generate_tags(&text).await?
        } else {
            Vec::new()
        };

        self.store.set_digest(conversation_id, &summary, &tags).await?;
        info!(
            "Digest stored for conversation {} ({} tags)",
            conversation_id,
            tags.len()
        );
        self.authorize(owner, conversation_id).await
    }

    pub async fn transcribe(&self, audio: Bytes) -> Result<String> {
        let transcriber = self
            .transcriber
            .as_ref()
            .ok_or(SpeechError::NotConfigured("Speech recognition"))?;
        Ok(transcriber.transcribe(audio).await?)
    }

    pub async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let synthesizer = self
            .synthesizer
            .as_ref()
            .ok_or(SpeechError::NotConfigured("Speech synthesis"))?;
        let audio = synthesizer.synthesize(text).await?;
        Ok(SynthesizedAudio {
            audio,
            format: synthesizer.format().to_string(),
        })
    }
}

async fn assign_title(
    labeler: &Labeler,
    store: &dyn ConversationStore,
    conversation_id: ConversationId,
    first_message: &str,
) -> Result<String> {
    let title = labeler.generate_title(first_message).await?;
    store.set_title(conversation_id, &title).await?;
    Ok(title)
}
