//! Speech transcription and synthesis at the edges of the voice path
//!
//! Both engines are external HTTP services. Transcription takes raw audio
//! bytes and returns text; synthesis takes text and returns audio bytes in the
//! configured format.

use crate::config::SpeechConfig;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Audio to text
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Bytes) -> Result<String, SpeechError>;
}

/// Text to audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Bytes, SpeechError>;

    /// Container format of the returned audio (e.g. `wav`)
    fn format(&self) -> &str;
}

/// Speech errors
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
}

fn http_client(config: &SpeechConfig) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(config.timeout()).build()
}

/// Posts raw audio to a transcription service that answers `{"text": ...}`
pub struct HttpTranscriber {
    client: Client,
    url: String,
    language: String,
    format: String,
}

impl HttpTranscriber {
    /// `None` when no transcription service is configured
    pub fn from_config(config: &SpeechConfig) -> Result<Option<Self>, SpeechError> {
        let Some(url) = config.stt_url.clone() else {
            return Ok(None);
        };
        let client = http_client(config).map_err(|e| SpeechError::Transcription(e.to_string()))?;
        Ok(Some(Self {
            client,
            url,
            language: config.language.clone(),
            format: config.audio_format.clone(),
        }))
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: Bytes) -> Result<String, SpeechError> {
        debug!("Transcribing {} bytes of audio", audio.len());

        let response = self
            .client
            .post(&self.url)
            .query(&[("language", self.language.as_str())])
            .header(reqwest::header::CONTENT_TYPE, format!("audio/{}", self.format))
            .body(audio)
            .send()
            .await
            .map_err(|e| SpeechError::Transcription(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SpeechError::Transcription(format!("HTTP {}: {}", status, body)));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| SpeechError::Transcription(format!("Failed to parse response: {}", e)))?;

        Ok(parsed.text.trim().to_string())
    }
}

/// Posts `{"text", "voice"}` to a synthesis service and returns the body bytes
pub struct HttpSynthesizer {
    client: Client,
    url: String,
    voice: String,
    format: String,
}

impl HttpSynthesizer {
    /// `None` when no synthesis service is configured
    pub fn from_config(config: &SpeechConfig) -> Result<Option<Self>, SpeechError> {
        let Some(url) = config.tts_url.clone() else {
            return Ok(None);
        };
        let client = http_client(config).map_err(|e| SpeechError::Synthesis(e.to_string()))?;
        Ok(Some(Self {
            client,
            url,
            voice: config.voice.clone(),
            format: config.audio_format.clone(),
        }))
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Bytes, SpeechError> {
        debug!("Synthesizing {} characters", text.len());

        let response = self
            .client
            .post(&self.url)
            .json(&SynthesisRequest {
                text,
                voice: &self.voice,
            })
            .send()
            .await
            .map_err(|e| SpeechError::Synthesis(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SpeechError::Synthesis(format!("HTTP {}: {}", status, body)));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| SpeechError::Synthesis(e.to_string()))?;

        if audio.is_empty() {
            return Err(SpeechError::Synthesis("empty audio".to_string()));
        }
        Ok(audio)
    }

    fn format(&self) -> &str {
        &self.format
    }
}
