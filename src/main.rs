use anyhow::Context;
use chat_orchestrator::api::{build_router, AppState};
use chat_orchestrator::auth::TokenVerifier;
use chat_orchestrator::chat::{ChatOrchestrator, OrchestratorSettings};
use chat_orchestrator::config::{Config, LoggingConfig};
use chat_orchestrator::context::{
    CompressionEngine, LlmSummarizer, Summarizer, SummarizerConfig, TokenCounter,
};
use chat_orchestrator::llm::{ChatBackend, Labeler, OpenAiCompatibleClient};
use chat_orchestrator::speech::{HttpSynthesizer, HttpTranscriber, Synthesizer, Transcriber};
use chat_orchestrator::store::{ConversationStore, SqliteStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::var("CHAT_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_tracing(&config.logging);

    let verifier = Arc::new(TokenVerifier::new(
        config.auth.secret_key,
        config.auth.token_ttl_minutes,
    ));

    // `chat-orchestrator issue-token <user_id>` prints a bearer token and exits
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("issue-token") {
        let user_id: i64 = args
            .get(2)
            .context("usage: chat-orchestrator issue-token <user_id>")?
            .parse()
            .context("user_id must be an integer")?;
        println!("{}", verifier.issue(user_id)?);
        return Ok(());
    }

    info!("Starting chat-orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::open(&config.database.path)?);

    let main_backend: Arc<dyn ChatBackend> = Arc::new(
        OpenAiCompatibleClient::new(config.llm.main_model.clone())?.with_thinking_disabled(),
    );
    let summary_backend: Arc<dyn ChatBackend> =
        Arc::new(OpenAiCompatibleClient::new(config.llm.summary_model.clone())?);
    info!(
        "Models: chat={} summary={}",
        config.llm.main_model.model, config.llm.summary_model.model
    );

    let summarizer: Arc<dyn Summarizer> = Arc::new(LlmSummarizer::new(
        Arc::clone(&summary_backend),
        SummarizerConfig {
            instruction: config.context.summary_prompt.clone(),
            ..SummarizerConfig::default()
        },
    ));
    let compression = Arc::new(CompressionEngine::new(
        TokenCounter::from_kind(config.context.tokenizer),
        Arc::clone(&summarizer),
        config.context.compression_settings(),
    ));
    let labeler = Labeler::new(summary_backend, config.context.tags_prompt.clone());

    let transcriber = HttpTranscriber::from_config(&config.speech)?
        .map(|t| Arc::new(t) as Arc<dyn Transcriber>);
    let synthesizer = HttpSynthesizer::from_config(&config.speech)?
        .map(|s| Arc::new(s) as Arc<dyn Synthesizer>);
    info!(
        "Speech: transcription {}, synthesis {}",
        if transcriber.is_some() { "on" } else { "off" },
        if synthesizer.is_some() { "on" } else { "off" }
    );

    let orchestrator = Arc::new(
        ChatOrchestrator::new(
            store,
            main_backend,
            compression,
            summarizer,
            labeler,
            OrchestratorSettings {
                system_prompt: config.llm.system_prompt.clone(),
                stream_idle_timeout: config.llm.stream_idle_timeout(),
            },
        )
        .with_speech(transcriber, synthesizer),
    );

    let app = build_router(
        AppState {
            orchestrator,
            verifier,
        },
        config.server.max_body_bytes,
    );

    let addr = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
