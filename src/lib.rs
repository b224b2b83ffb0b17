//! Conversational assistant backend
//!
//! Persists chat turns, streams model replies to clients and keeps every
//! model window inside a token budget by folding older turns into a running
//! summary.
//!
//! - [`context`]: token counting, window assembly, compression
//! - [`chat`]: the per-turn orchestrator and live session registry
//! - [`llm`], [`speech`], [`store`]: external collaborators behind traits
//! - [`api`]: axum router with REST and WebSocket endpoints

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod speech;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
