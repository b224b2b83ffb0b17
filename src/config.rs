//! Service configuration
//!
//! Loaded from an optional TOML file layered with `CHAT__`-prefixed
//! environment variables (`CHAT__CONTEXT__MAX_TOKENS=8192`). Every field has a
//! default, so an empty file is a valid configuration.

use crate::context::{CompressionSettings, TokenizerKind};
use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load `path` (if it exists) and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("CHAT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the compression engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let threshold = self.context.compression_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Configuration(format!(
                "context.compression_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.context.max_tokens == 0 {
            return Err(Error::Configuration("context.max_tokens must be positive".to_string()));
        }
        if self.context.keep_recent == 0 {
            return Err(Error::Configuration("context.keep_recent must be positive".to_string()));
        }
        Ok(())
    }
}

/// HTTP listener
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Request body limit, which also caps REST audio uploads
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:`
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "data/chat.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Bearer token signing
#[derive(Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_secret_key")]
    pub secret_key: SecretString,

    #[serde(default = "default_token_ttl_minutes")]
    pub token_ttl_minutes: u64,
}

fn default_secret_key() -> SecretString {
    SecretString::new("change-me-in-production".to_string())
}

fn default_token_ttl_minutes() -> u64 {
    60 * 24
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: default_secret_key(),
            token_ttl_minutes: default_token_ttl_minutes(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret_key", &"[REDACTED]")
            .field("token_ttl_minutes", &self.token_ttl_minutes)
            .finish()
    }
}

/// One OpenAI-compatible model endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_api_key")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:1234/v1".to_string()
}

fn default_api_key() -> Option<String> {
    Some("lm-studio".to_string())
}

fn default_model() -> String {
    "default".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: default_api_key(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Defaults for the model used for summaries, titles and tags
    pub fn summary_default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.3,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub main_model: ModelConfig,

    #[serde(default = "ModelConfig::summary_default")]
    pub summary_model: ModelConfig,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Longest gap between streamed chunks before the turn fails
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

fn default_system_prompt() -> String {
    "You are a helpful, friendly assistant. Answer clearly and concisely.".to_string()
}

fn default_stream_idle_timeout_secs() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            main_model: ModelConfig::default(),
            summary_model: ModelConfig::summary_default(),
            system_prompt: default_system_prompt(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

/// Token budget and compression
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: f64,

    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,

    #[serde(default = "default_summary_prompt")]
    pub summary_prompt: String,

    #[serde(default = "default_tags_prompt")]
    pub tags_prompt: String,

    #[serde(default)]
    pub tokenizer: TokenizerKind,
}

fn default_context_max_tokens() -> usize {
    4096
}

fn default_compression_threshold() -> f64 {
    0.8
}

fn default_keep_recent() -> usize {
    4
}

fn default_summary_prompt() -> String {
    "Summarize the key points of the following conversation, keeping important facts and \
     decisions. Output a concise summary:"
        .to_string()
}

fn default_tags_prompt() -> String {
    "Generate 3-5 short tags for the following conversation. Output only the tags, separated \
     by commas:"
        .to_string()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_context_max_tokens(),
            compression_threshold: default_compression_threshold(),
            keep_recent: default_keep_recent(),
            summary_prompt: default_summary_prompt(),
            tags_prompt: default_tags_prompt(),
            tokenizer: TokenizerKind::default(),
        }
    }
}

impl ContextConfig {
    pub fn compression_settings(&self) -> CompressionSettings {
        CompressionSettings {
            max_tokens: self.max_tokens,
            threshold: self.compression_threshold,
            keep_recent: self.keep_recent,
        }
    }
}

/// External speech engines; either side may be left unconfigured
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechConfig {
    #[serde(default)]
    pub stt_url: Option<String>,

    #[serde(default)]
    pub tts_url: Option<String>,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_audio_format")]
    pub audio_format: String,

    #[serde(default = "default_speech_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_voice() -> String {
    "default".to_string()
}

fn default_audio_format() -> String {
    "wav".to_string()
}

fn default_speech_timeout_secs() -> u64 {
    60
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            stt_url: None,
            tts_url: None,
            language: default_language(),
            voice: default_voice(),
            audio_format: default_audio_format(),
            timeout_secs: default_speech_timeout_secs(),
        }
    }
}

impl SpeechConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
