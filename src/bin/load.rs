use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

use bard::config::AppConfig;
use bard::db::Database;
use bard::models::{ChapterAlignment, PreparedText};
use bard::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "bard-load")]
#[command(about = "Load prepared audiobook text and sentence alignments into SQLite")]
struct Cli {
    /// Prepared text JSON: chapters with their ordered sentences.
    #[arg(long)]
    text: Option<PathBuf>,
    /// Alignment JSON for one chapter; repeat for several chapters.
    #[arg(long = "alignment")]
    alignments: Vec<PathBuf>,
    /// Chapter audio as `CHAPTER_ID=PATH:SECONDS`, PATH relative to the data dir.
    #[arg(long = "chapter-audio", value_parser = parse_chapter_audio)]
    chapter_audio: Vec<ChapterAudio>,
    #[arg(long, default_value_t = false)]
    reset: bool,
    /// Report sentences with missing or invalid timings.
    #[arg(long, default_value_t = false)]
    validate: bool,
}

#[derive(Clone, Debug)]
struct ChapterAudio {
    chapter_id: i64,
    path: String,
    duration_seconds: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let db = Database::new(&config).await?;

    if cli.reset {
        db.reset().await?;
        println!("Cleared chapters and sentences.");
    }

    if let Some(path) = &cli.text {
        load_text(&db, path).await?;
    }

    for audio in &cli.chapter_audio {
        db.update_chapter_audio(audio.chapter_id, &audio.path, audio.duration_seconds)
            .await?;
        println!(
            "Chapter {}: audio {} ({:.2}s)",
            audio.chapter_id, audio.path, audio.duration_seconds
        );
    }

    let mut failed = 0usize;
    for path in &cli.alignments {
        let alignment: ChapterAlignment = read_json(path).await?;
        match db
            .apply_chapter_alignment(alignment.chapter_id, &alignment.sentences)
            .await
        {
            Ok(count) => println!("Chapter {}: aligned {count} sentences", alignment.chapter_id),
            Err(err) => {
                failed += 1;
                tracing::error!(
                    chapter_id = alignment.chapter_id,
                    path = %path.display(),
                    "alignment rejected: {err:#}"
                );
            }
        }
    }

    if cli.validate {
        let issues = db.validate_alignments().await?;
        if issues.is_empty() {
            println!("All sentences have valid alignment.");
        } else {
            for issue in &issues {
                println!("  {issue}");
            }
            println!("Found {} alignment issues.", issues.len());
        }
    }

    println!(
        "Database {} holds {} sentences.",
        config.db_path.display(),
        db.total_sentence_count().await?
    );

    if failed > 0 {
        anyhow::bail!("{failed} alignment file(s) were rejected");
    }
    Ok(())
}

async fn load_text(db: &Database, path: &Path) -> Result<()> {
    let prepared: PreparedText = read_json(path).await?;

    // Rejects half-aligned rows and duplicate ids before anything is written.
    MemoryStore::from_prepared(&prepared)
        .with_context(|| format!("invalid prepared text {}", path.display()))?;

    let mut loaded = 0usize;
    for chapter in &prepared.chapters {
        db.insert_chapter(&chapter.chapter()).await?;
        db.insert_sentences(&chapter.sentences).await?;
        loaded += chapter.sentences.len();
        tracing::info!(
            chapter_id = chapter.chapter_id,
            sentences = chapter.sentences.len(),
            "loaded chapter"
        );
    }

    if prepared.total_sentences > 0 && prepared.total_sentences as usize != loaded {
        tracing::warn!(
            declared = prepared.total_sentences,
            loaded,
            "sentence count differs from the prepared text header"
        );
    }

    println!(
        "Loaded {} chapters, {loaded} sentences from {}",
        prepared.chapters.len(),
        path.display()
    );
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_chapter_audio(raw: &str) -> Result<ChapterAudio, String> {
    let (id, rest) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected CHAPTER_ID=PATH:SECONDS, got {raw:?}"))?;
    let (path, seconds) = rest
        .rsplit_once(':')
        .ok_or_else(|| format!("missing duration in {raw:?}"))?;

    let chapter_id = id
        .trim()
        .parse()
        .map_err(|_| format!("invalid chapter id {id:?}"))?;
    let duration_seconds: f64 = seconds
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {seconds:?}"))?;
    if !duration_seconds.is_finite() || duration_seconds < 0.0 || path.trim().is_empty() {
        return Err(format!("invalid chapter audio {raw:?}"));
    }

    Ok(ChapterAudio {
        chapter_id,
        path: path.trim().to_string(),
        duration_seconds,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_audio_argument_parses() {
        let audio = parse_chapter_audio("3=audio/chapter_3.mp3:612.5").unwrap();
        assert_eq!(audio.chapter_id, 3);
        assert_eq!(audio.path, "audio/chapter_3.mp3");
        assert_eq!(audio.duration_seconds, 612.5);

        assert!(parse_chapter_audio("audio/chapter_3.mp3").is_err());
        assert!(parse_chapter_audio("x=audio.mp3:1").is_err());
        assert!(parse_chapter_audio("3=audio.mp3:-1").is_err());
    }
}
