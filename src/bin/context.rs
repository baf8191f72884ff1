use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bard::config::AppConfig;
use bard::context::{preview_text, ContextAssembler};
use bard::db::Database;
use bard::models::PreparedText;
use bard::resolver::PositionResolver;
use bard::store::{MemoryStore, SentenceStore};
use bard::tokenizer::TiktokenCounter;

#[derive(Parser, Debug)]
#[command(name = "bard-context")]
#[command(about = "Show what the narrator may disclose at a playback position")]
struct Cli {
    #[arg(long)]
    chapter: i64,
    /// Playback position in seconds from the chapter start.
    #[arg(long)]
    time: f64,
    /// Token budget for the context; 0 disables truncation. Defaults to MAX_CONTEXT_TOKENS.
    #[arg(long)]
    budget: Option<usize>,
    /// Read a prepared text JSON instead of the database.
    #[arg(long)]
    text: Option<PathBuf>,
    /// Characters of context to print; 0 prints all of it.
    #[arg(long, default_value_t = 2000)]
    preview: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let store: Arc<dyn SentenceStore> = match &cli.text {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let prepared: PreparedText = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Arc::new(MemoryStore::from_prepared(&prepared)?)
        }
        None => Arc::new(Database::new(&config).await?),
    };

    let resolver = PositionResolver::new(store.clone());
    let assembler = ContextAssembler::new(store, Arc::new(TiktokenCounter::new()?));
    let budget = cli.budget.unwrap_or(config.tokens.max_context_tokens);

    let position = resolver.resolve(cli.chapter, cli.time).await?;
    let context = assembler.assemble(position.sentence_id, budget).await?;

    println!(
        "Chapter {} at {:.2}s -> sentence {} ({:?})",
        cli.chapter, cli.time, position.sentence_id, position.rule
    );
    println!("  \"{}\"", position.sentence.text);
    println!(
        "Context: {} sentences across {} chapters, {} tokens ({} sent{})",
        context.sentence_count,
        context.chapter_count,
        context.estimated_tokens,
        context.transmitted_tokens,
        if context.truncated { ", truncated" } else { "" }
    );
    for span in &context.spans {
        println!(
            "  chapter {}: sentences {}..={} ({})",
            span.chapter_id, span.first_sentence_id, span.last_sentence_id, span.sentence_count
        );
    }
    println!();

    let shown = if cli.preview == 0 {
        context.text
    } else {
        preview_text(&context.text, cli.preview)
    };
    println!("{shown}");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
