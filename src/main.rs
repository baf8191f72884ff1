use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use bard::context::ContextAssembler;
use bard::db::Database;
use bard::narrator::OllamaNarrator;
use bard::ollama::OllamaClient;
use bard::pipeline::AnswerPipeline;
use bard::resolver::PositionResolver;
use bard::store::SentenceStore;
use bard::tokenizer::TiktokenCounter;
use bard::tts::ElevenLabsSynthesizer;
use bard::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let db = Database::new(&config).await?;
    let sentences = db.total_sentence_count().await?;
    if sentences == 0 {
        tracing::warn!(
            "database at {} holds no sentences; load a prepared text with bard-load",
            config.db_path.display()
        );
    }

    let store: Arc<dyn SentenceStore> = Arc::new(db);
    let tokenizer = Arc::new(TiktokenCounter::new()?);

    let ollama = OllamaClient::new(config.ollama_base_url.clone());
    let narrator = OllamaNarrator::new(ollama, &config);

    if !config.speech.is_configured() {
        tracing::warn!("speech synthesis not configured; answers will be text only");
    }
    let synthesizer = ElevenLabsSynthesizer::new(config.speech.clone(), config.answers_dir());

    let generation_limit = Arc::new(Semaphore::new(config.timeouts.max_concurrent_generations));

    let pipeline = AnswerPipeline::new(
        &config,
        PositionResolver::new(store.clone()),
        ContextAssembler::new(store.clone(), tokenizer),
        Arc::new(narrator),
        Arc::new(synthesizer),
        generation_limit,
    );

    tracing::info!(
        sentences,
        model = %config.models.answer_model,
        token_budget = config.tokens.max_context_tokens,
        "bard ready"
    );

    run_server(config, store, pipeline).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
