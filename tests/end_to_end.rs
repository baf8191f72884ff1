use std::sync::Arc;

use bard::context::{chapter_marker, ContextAssembler};
use bard::db::Database;
use bard::models::{AlignmentSpan, Chapter, ResolutionRule, Sentence};
use bard::resolver::PositionResolver;
use bard::store::SentenceStore;
use bard::tokenizer::{TiktokenCounter, WhitespaceCounter};
use bard::BardError;

fn chapter(chapter_id: i64) -> Chapter {
    Chapter {
        chapter_id,
        title: format!("Chapter {chapter_id}"),
        audio_path: Some(format!("audio/chapter_{chapter_id}.mp3")),
        duration_seconds: None,
    }
}

fn unaligned(sentence_id: i64, chapter_id: i64, sequence: i64, text: &str) -> Sentence {
    Sentence {
        sentence_id,
        chapter_id,
        sequence,
        text: text.to_string(),
        start_time: None,
        end_time: None,
    }
}

fn span(sentence_id: i64, start: f64, end: f64) -> AlignmentSpan {
    AlignmentSpan {
        sentence_id,
        start,
        end,
    }
}

/// Loads the two-chapter book the way `bard-load` does: text first, then alignment.
async fn loaded_book() -> Arc<Database> {
    let db = Database::in_memory().await.unwrap();

    db.insert_chapter(&chapter(1)).await.unwrap();
    db.insert_sentences(&[
        unaligned(1, 1, 0, "First sentence."),
        unaligned(2, 1, 1, "Second sentence."),
        unaligned(3, 1, 2, "Third sentence."),
    ])
    .await
    .unwrap();
    db.insert_chapter(&chapter(2)).await.unwrap();
    db.insert_sentences(&[
        unaligned(4, 2, 0, "Fourth sentence."),
        unaligned(5, 2, 1, "Fifth sentence."),
    ])
    .await
    .unwrap();

    db.apply_chapter_alignment(1, &[span(1, 0.0, 2.0), span(2, 2.0, 4.0), span(3, 4.0, 6.0)])
        .await
        .unwrap();
    db.apply_chapter_alignment(2, &[span(4, 0.0, 3.0), span(5, 3.0, 5.0)])
        .await
        .unwrap();

    Arc::new(db)
}

#[tokio::test]
async fn position_to_context_round_trip() {
    let db = loaded_book().await;
    let store: Arc<dyn SentenceStore> = db.clone();
    let resolver = PositionResolver::new(store.clone());
    let assembler = ContextAssembler::new(store, Arc::new(WhitespaceCounter));

    let position = resolver.resolve(2, 1.5).await.unwrap();
    assert_eq!(position.sentence_id, 4);
    assert_eq!(position.rule, ResolutionRule::Containment);

    let context = assembler.assemble(position.sentence_id, 0).await.unwrap();
    assert_eq!(
        context.text,
        format!(
            "{}\nFirst sentence. Second sentence. Third sentence.\n\n{}\nFourth sentence.",
            chapter_marker(1),
            chapter_marker(2)
        )
    );
    assert!(!context.text.contains("Fifth sentence."));
    assert_eq!(context.sentence_count, 4);
    assert_eq!(context.chapter_count, 2);
    assert!(!context.truncated);
}

#[tokio::test]
async fn boundaries_and_out_of_range_times_resolve() {
    let db = loaded_book().await;
    let resolver = PositionResolver::new(db);

    assert_eq!(resolver.resolve(1, 1.0).await.unwrap().sentence_id, 1);
    assert_eq!(resolver.resolve(1, 3.0).await.unwrap().sentence_id, 2);
    assert_eq!(resolver.resolve(1, 2.0).await.unwrap().sentence_id, 2);
    assert_eq!(resolver.resolve(1, -4.0).await.unwrap().sentence_id, 1);
    assert_eq!(resolver.resolve(1, 10_000.0).await.unwrap().sentence_id, 3);

    let err = resolver.resolve(7, 1.0).await.unwrap_err();
    assert!(matches!(err, BardError::ChapterNotFound(7)));
}

#[tokio::test]
async fn overlapping_alignment_leaves_the_chapter_untouched() {
    let db = loaded_book().await;

    let rejected = db
        .apply_chapter_alignment(2, &[span(4, 0.0, 3.5), span(5, 3.0, 5.0)])
        .await;
    assert!(rejected.is_err());

    let alignment = db.chapter_alignment(2).await.unwrap();
    assert_eq!(alignment.len(), 2);
    assert_eq!(alignment[0].end_time, 3.0);
    assert!(db.validate_alignments().await.unwrap().is_empty());
}

#[tokio::test]
async fn bpe_budget_keeps_the_latest_sentence() {
    let db = loaded_book().await;
    let assembler = ContextAssembler::new(db, Arc::new(TiktokenCounter::new().unwrap()));

    let full = assembler.assemble(4, 0).await.unwrap();
    let budget = full.estimated_tokens - 3;
    let truncated = assembler.assemble(4, budget).await.unwrap();

    assert!(truncated.truncated);
    assert!(truncated.transmitted_tokens <= budget);
    assert!(truncated.text.ends_with("Fourth sentence."));
    assert_eq!(truncated.sentence_count, 4);
}
