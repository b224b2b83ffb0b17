//! Context management with token budget enforcement
//!
//! Token accounting, window assembly and compression of older turns into a
//! running summary. Everything here except [`CompressionEngine::maybe_compress`]
//! is free of I/O.

pub mod compression;
pub mod models;
pub mod summarizer;
pub mod token_estimator;
pub mod window;

pub use compression::{CompressionEngine, CompressionOutcome, CompressionPlan, CompressionSettings};
pub use models::{
    ChatMessage, Conversation, ConversationId, NewTurn, Role, Turn, TurnId, UserId, DEFAULT_TITLE,
};
pub use summarizer::{LlmSummarizer, Summarizer, SummarizerConfig, SummarizerError};
pub use token_estimator::{
    CharLengthEstimator, TiktokenEstimator, TokenCounter, TokenEstimator, TokenizerError, TokenizerKind,
    WordBasedEstimator, PER_TURN_OVERHEAD,
};
pub use window::{build_window, render_transcript, SUMMARY_PREFIX};
