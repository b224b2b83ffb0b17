//! Streaming chat orchestration
//!
//! [`ChatOrchestrator`] runs each user turn through persistence, compression,
//! window assembly and model streaming. [`SessionRegistry`] tracks the live
//! duplex sessions per conversation and [`ConversationLocks`] keeps at most
//! one turn in flight per conversation.

pub mod events;
pub mod locks;
pub mod orchestrator;
pub mod registry;

pub use events::{ClientMessage, InboundKind, MessageView, ServerEvent, TurnStatus};
pub use locks::{ConversationGuard, ConversationLocks};
pub use orchestrator::{
    ChatExchange, ChatOrchestrator, ConversationExport, OrchestratorSettings, SynthesizedAudio, TurnStage,
};
pub use registry::{RegistrationGuard, Session, SessionId, SessionRegistry};
