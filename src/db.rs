use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::config::AppConfig;
use crate::error::BardError;
use crate::models::{
    AlignmentSpan, Chapter, ChapterInfo, Sentence, SentenceAlignment,
};
use crate::store::{
    alignment_issues, check_alignment, check_monotonic, check_sentence, SentenceStore,
};

const SENTENCE_COLUMNS: &str = "sentence_id, chapter_id, sequence, text, start_time, end_time";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Self::connect(&config.sqlite_dsn()).await
    }

    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)
            .with_context(|| format!("invalid sqlite dsn {dsn}"))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Single-connection in-memory database; the schema lives as long as the pool.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chapters (
                chapter_id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                audio_path TEXT,
                duration_seconds REAL
            );

            CREATE TABLE IF NOT EXISTS sentences (
                sentence_id INTEGER PRIMARY KEY,
                chapter_id INTEGER NOT NULL REFERENCES chapters(chapter_id),
                sequence INTEGER NOT NULL,
                text TEXT NOT NULL,
                start_time REAL,
                end_time REAL,
                UNIQUE (chapter_id, sequence)
            );

            CREATE INDEX IF NOT EXISTS idx_sentences_chapter ON sentences(chapter_id, sequence);
            CREATE INDEX IF NOT EXISTS idx_sentences_time ON sentences(chapter_id, start_time);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sentences").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM chapters").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_chapter(&self, chapter: &Chapter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chapters (chapter_id, title, audio_path, duration_seconds)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chapter_id) DO UPDATE SET
                title = excluded.title,
                audio_path = excluded.audio_path,
                duration_seconds = excluded.duration_seconds
            "#,
        )
        .bind(chapter.chapter_id)
        .bind(&chapter.title)
        .bind(&chapter.audio_path)
        .bind(chapter.duration_seconds)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_sentences(&self, sentences: &[Sentence]) -> Result<()> {
        for sentence in sentences {
            check_sentence(sentence)?;
        }

        let mut tx = self.pool.begin().await?;
        for sentence in sentences {
            insert_sentence_tx(&mut tx, sentence).await?;
        }

        let chapters: BTreeSet<i64> = sentences.iter().map(|s| s.chapter_id).collect();
        for chapter_id in chapters {
            let rows = chapter_sentences_tx(&mut tx, chapter_id).await?;
            check_monotonic(chapter_id, &rows)?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn update_chapter_audio(
        &self,
        chapter_id: i64,
        audio_path: &str,
        duration_seconds: f64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE chapters SET audio_path = ?, duration_seconds = ? WHERE chapter_id = ?",
        )
        .bind(audio_path)
        .bind(duration_seconds)
        .bind(chapter_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BardError::ChapterNotFound(chapter_id).into());
        }
        Ok(())
    }

    /// Applies one chapter's alignment atomically after validating it against
    /// the chapter's current rows, so readers never see a half-aligned chapter.
    pub async fn apply_chapter_alignment(
        &self,
        chapter_id: i64,
        spans: &[AlignmentSpan],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let current = chapter_sentences_tx(&mut tx, chapter_id).await?;
        check_alignment(chapter_id, &current, spans)?;

        for span in spans {
            sqlx::query("UPDATE sentences SET start_time = ?, end_time = ? WHERE sentence_id = ?")
                .bind(span.start)
                .bind(span.end)
                .bind(span.sentence_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(spans.len())
    }

    /// Lists sentences with missing, inverted or overlapping timings, per chapter.
    pub async fn validate_alignments(&self) -> Result<Vec<String>> {
        let mut issues = Vec::new();
        for chapter in self.list_chapters().await? {
            let sentences = self.chapter_sentences(chapter.chapter_id).await?;
            issues.extend(alignment_issues(chapter.chapter_id, &sentences));
        }
        Ok(issues)
    }

    pub async fn total_sentence_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM sentences")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    async fn fetch_sentences(&self, sql: &str, bind: i64) -> Result<Vec<Sentence>> {
        let rows: Vec<SqliteRow> = sqlx::query(sql).bind(bind).fetch_all(&self.pool).await?;
        let sentences = rows
            .into_iter()
            .map(row_to_sentence)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sentences)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SentenceStore for Database {
    async fn sentence(&self, sentence_id: i64) -> Result<Option<Sentence>> {
        let row = sqlx::query(&format!(
            "SELECT {SENTENCE_COLUMNS} FROM sentences WHERE sentence_id = ?"
        ))
        .bind(sentence_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_sentence).transpose()?)
    }

    async fn chapter(&self, chapter_id: i64) -> Result<Option<Chapter>> {
        let row = sqlx::query(
            r#"
            SELECT chapter_id, title, audio_path, duration_seconds
            FROM chapters
            WHERE chapter_id = ?
            "#,
        )
        .bind(chapter_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Chapter {
            chapter_id: r.get("chapter_id"),
            title: r.get("title"),
            audio_path: r.get("audio_path"),
            duration_seconds: r.get("duration_seconds"),
        }))
    }

    async fn chapter_sentences(&self, chapter_id: i64) -> Result<Vec<Sentence>> {
        self.fetch_sentences(
            &format!(
                "SELECT {SENTENCE_COLUMNS} FROM sentences WHERE chapter_id = ? ORDER BY sequence"
            ),
            chapter_id,
        )
        .await
    }

    async fn sentences_up_to(&self, sentence_id: i64) -> Result<Vec<Sentence>> {
        self.fetch_sentences(
            &format!(
                "SELECT {SENTENCE_COLUMNS} FROM sentences WHERE sentence_id <= ? \
                 ORDER BY chapter_id, sequence"
            ),
            sentence_id,
        )
        .await
    }

    async fn list_chapters(&self) -> Result<Vec<ChapterInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT c.chapter_id, c.title, c.duration_seconds, COUNT(s.sentence_id) AS sentence_count
            FROM chapters c
            LEFT JOIN sentences s ON c.chapter_id = s.chapter_id
            GROUP BY c.chapter_id
            ORDER BY c.chapter_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ChapterInfo {
                chapter_id: r.get("chapter_id"),
                title: r.get("title"),
                duration_seconds: r.get("duration_seconds"),
                sentence_count: r.get("sentence_count"),
            })
            .collect())
    }

    async fn chapter_alignment(&self, chapter_id: i64) -> Result<Vec<SentenceAlignment>> {
        let rows = sqlx::query(
            r#"
            SELECT sentence_id, sequence, text, start_time, end_time
            FROM sentences
            WHERE chapter_id = ? AND start_time IS NOT NULL AND end_time IS NOT NULL
            ORDER BY sequence
            "#,
        )
        .bind(chapter_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| SentenceAlignment {
                sentence_id: r.get("sentence_id"),
                sequence: r.get("sequence"),
                text: r.get("text"),
                start_time: r.get("start_time"),
                end_time: r.get("end_time"),
            })
            .collect())
    }
}

async fn insert_sentence_tx(tx: &mut Transaction<'_, Sqlite>, sentence: &Sentence) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO sentences (sentence_id, chapter_id, sequence, text, start_time, end_time)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(sentence.sentence_id)
    .bind(sentence.chapter_id)
    .bind(sentence.sequence)
    .bind(&sentence.text)
    .bind(sentence.start_time)
    .bind(sentence.end_time)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to insert sentence {}", sentence.sentence_id))?;

    Ok(())
}

async fn chapter_sentences_tx(
    tx: &mut Transaction<'_, Sqlite>,
    chapter_id: i64,
) -> Result<Vec<Sentence>> {
    let rows = sqlx::query(&format!(
        "SELECT {SENTENCE_COLUMNS} FROM sentences WHERE chapter_id = ? ORDER BY sequence"
    ))
    .bind(chapter_id)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows
        .into_iter()
        .map(row_to_sentence)
        .collect::<Result<Vec<_>, _>>()?)
}

fn row_to_sentence(row: SqliteRow) -> Result<Sentence, BardError> {
    let sentence = Sentence {
        sentence_id: row.get("sentence_id"),
        chapter_id: row.get("chapter_id"),
        sequence: row.get("sequence"),
        text: row.get("text"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
    };
    check_sentence(&sentence)?;
    Ok(sentence)
}
