//! Builds the spoiler-free narrative context for a resolved sentence.
//!
//! The context is every sentence with `sentence_id <= up_to`, in narrative
//! order, with a marker line opening each chapter. When it exceeds the token
//! budget the oldest text is dropped first and the remainder is re-aligned to
//! a chapter or sentence boundary.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::BardResult;
use crate::models::{ChapterSpan, NarrativeContext, ResolutionRule, Sentence};
use crate::resolver;
use crate::store::SentenceStore;
use crate::tokenizer::TokenCounter;

pub const CHAPTER_MARKER_PREFIX: &str = "--- Chapter ";
const CHAPTER_LOOKAHEAD_CHARS: usize = 200;
const SENTENCE_LOOKAHEAD_CHARS: usize = 100;
const ELLIPSIS: &str = "...";

#[derive(Clone)]
pub struct ContextAssembler {
    store: Arc<dyn SentenceStore>,
    tokenizer: Arc<dyn TokenCounter>,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn SentenceStore>, tokenizer: Arc<dyn TokenCounter>) -> Self {
        Self { store, tokenizer }
    }

    /// A `token_budget` of 0 disables truncation.
    pub async fn assemble(
        &self,
        up_to_sentence_id: i64,
        token_budget: usize,
    ) -> BardResult<NarrativeContext> {
        let sentences = self.store.sentences_up_to(up_to_sentence_id).await?;
        let context = build_context(
            &sentences,
            up_to_sentence_id,
            token_budget,
            self.tokenizer.as_ref(),
        );

        tracing::debug!(
            up_to_sentence_id,
            sentences = context.sentence_count,
            chapters = context.chapter_count,
            estimated_tokens = context.estimated_tokens,
            transmitted_tokens = context.transmitted_tokens,
            truncated = context.truncated,
            "assembled narrative context"
        );

        Ok(context)
    }
}

pub fn chapter_marker(chapter_id: i64) -> String {
    format!("{CHAPTER_MARKER_PREFIX}{chapter_id} ---")
}

/// Assembles context from sentences already in narrative order.
pub fn build_context(
    sentences: &[Sentence],
    up_to_sentence_id: i64,
    token_budget: usize,
    tokenizer: &dyn TokenCounter,
) -> NarrativeContext {
    let visible: Vec<&Sentence> = sentences
        .iter()
        .filter(|s| s.sentence_id <= up_to_sentence_id)
        .collect();
    if visible.is_empty() {
        return NarrativeContext::empty(up_to_sentence_id);
    }

    let (text, spans) = render(&visible);
    let chapter_count = visible
        .iter()
        .map(|s| s.chapter_id)
        .collect::<HashSet<_>>()
        .len();
    let estimated_tokens = tokenizer.count(&text);

    let (text, truncated) = if token_budget == 0 || estimated_tokens <= token_budget {
        (text, false)
    } else {
        let latest = visible.last().map_or("", |s| s.text.trim());
        let cut = truncate_to_budget(&text, token_budget, tokenizer, latest);
        tracing::debug!(
            estimated_tokens,
            token_budget,
            "context exceeds budget; dropped oldest text"
        );
        (cut, true)
    };

    NarrativeContext {
        up_to_sentence_id,
        transmitted_tokens: if truncated {
            tokenizer.count(&text)
        } else {
            estimated_tokens
        },
        text,
        spans,
        sentence_count: visible.len(),
        chapter_count,
        estimated_tokens,
        truncated,
    }
}

fn render(sentences: &[&Sentence]) -> (String, Vec<ChapterSpan>) {
    let mut text = String::new();
    let mut spans: Vec<ChapterSpan> = Vec::new();

    for sentence in sentences {
        match spans.last_mut() {
            Some(span) if span.chapter_id == sentence.chapter_id => {
                span.last_sentence_id = sentence.sentence_id;
                span.sentence_count += 1;
                text.push(' ');
            }
            _ => {
                if !text.is_empty() {
                    text.push_str("\n\n");
                }
                text.push_str(&chapter_marker(sentence.chapter_id));
                text.push('\n');
                spans.push(ChapterSpan {
                    chapter_id: sentence.chapter_id,
                    first_sentence_id: sentence.sentence_id,
                    last_sentence_id: sentence.sentence_id,
                    sentence_count: 1,
                });
            }
        }
        text.push_str(sentence.text.trim());
    }

    (text, spans)
}

/// Keeps the most recent tokens of `text` so the aligned result fits `budget`.
///
/// `latest` is the text of the final sentence; no boundary inside it is used.
pub fn truncate_to_budget(
    text: &str,
    budget: usize,
    tokenizer: &dyn TokenCounter,
    latest: &str,
) -> String {
    let mut keep = budget;
    loop {
        let tail = tokenizer.truncate_to_last(text, keep);
        let aligned = align_to_boundary(&tail, latest);
        let used = tokenizer.count(&aligned);
        if used <= budget || keep == 0 {
            return aligned;
        }
        keep = keep.saturating_sub((used - budget).max(1));
    }
}

/// Drops a leading sentence fragment, or marks it with an ellipsis when no
/// boundary is close to the front.
///
/// Boundaries are only searched before the start of `latest` when `tail` ends
/// with it; a tail that is exactly `latest` already starts on a sentence.
pub fn align_to_boundary(tail: &str, latest: &str) -> String {
    let tail = tail.trim_start();
    if tail.is_empty() {
        return String::new();
    }
    if !latest.is_empty() && tail == latest {
        return tail.to_string();
    }

    let searchable = match tail.strip_suffix(latest) {
        Some(head) => head,
        None => "",
    };

    if let Some(pos) = searchable.find(CHAPTER_MARKER_PREFIX) {
        if pos < byte_offset_of_char(tail, CHAPTER_LOOKAHEAD_CHARS) {
            return tail[pos..].to_string();
        }
    }

    if let Some(pos) = searchable.find(". ") {
        if pos < byte_offset_of_char(tail, SENTENCE_LOOKAHEAD_CHARS) {
            let rest = tail[pos + 2..].trim_start();
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }

    format!("{ELLIPSIS} {tail}")
}

fn byte_offset_of_char(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

/// What the listener has heard in the current chapter: sentences that have
/// finished by `audio_time`, limited to the last `max_words` words.
#[derive(Debug, Clone, PartialEq)]
pub struct HeardSoFar {
    pub current: Option<Sentence>,
    pub text: String,
    pub word_count: usize,
}

pub fn heard_so_far(chapter_sentences: &[Sentence], audio_time: f64, max_words: usize) -> HeardSoFar {
    let current = resolver::locate(chapter_sentences, audio_time)
        .filter(|(_, rule)| *rule == ResolutionRule::Containment)
        .map(|(sentence, _)| sentence.clone());

    let mut finished: Vec<&Sentence> = chapter_sentences
        .iter()
        .filter(|s| s.end_time.is_some_and(|end| end <= audio_time))
        .collect();
    finished.sort_by_key(|s| s.sequence);

    let joined = finished
        .iter()
        .map(|s| s.text.trim())
        .collect::<Vec<_>>()
        .join(" ");
    let words: Vec<&str> = joined.split_whitespace().collect();

    let (text, word_count) = if words.len() > max_words {
        (
            format!("{ELLIPSIS}{}", words[words.len() - max_words..].join(" ")),
            max_words,
        )
    } else {
        let word_count = words.len();
        (joined, word_count)
    };

    HeardSoFar {
        current,
        text,
        word_count,
    }
}

/// First `max_chars` characters of `text`, with a trailing ellipsis when cut.
pub fn preview_text(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{ELLIPSIS}", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{sentence, two_chapters};
    use crate::store::MemoryStore;
    use crate::tokenizer::{TiktokenCounter, WhitespaceCounter};

    fn assembler() -> ContextAssembler {
        let (chapters, sentences) = two_chapters();
        let store = MemoryStore::new(chapters, sentences).expect("valid fixture");
        ContextAssembler::new(Arc::new(store), Arc::new(WhitespaceCounter))
    }

    fn line(id: i64) -> String {
        format!("Line {id} ends here.")
    }

    /// Three chapters of forty sentences each, ids 1..=120.
    fn long_book() -> Vec<Sentence> {
        (1..=120)
            .map(|id| sentence(id, (id - 1) / 40 + 1, (id - 1) % 40, &line(id), None))
            .collect()
    }

    #[tokio::test]
    async fn context_stops_at_the_current_sentence() {
        let context = assembler().assemble(2, 10_000).await.unwrap();
        assert!(context.text.contains("First sentence."));
        assert!(context.text.contains("Second sentence."));
        assert!(!context.text.contains("Third sentence."));
        assert_eq!(context.sentence_count, 2);
        assert_eq!(context.chapter_count, 1);
    }

    #[tokio::test]
    async fn context_spans_prior_chapters_with_markers() {
        let context = assembler().assemble(4, 10_000).await.unwrap();

        assert_eq!(
            context.text,
            "--- Chapter 1 ---\nFirst sentence. Second sentence. Third sentence.\n\n\
             --- Chapter 2 ---\nFourth sentence."
        );
        assert!(!context.text.contains("Fifth sentence."));
        assert_eq!(context.sentence_count, 4);
        assert_eq!(context.chapter_count, 2);
        assert_eq!(context.spans.len(), 2);
        assert_eq!(context.spans[0].last_sentence_id, 3);
        assert_eq!(context.spans[1].first_sentence_id, 4);
        assert!(!context.truncated);
        assert_eq!(context.estimated_tokens, context.transmitted_tokens);
    }

    #[tokio::test]
    async fn no_sentences_yields_empty_context() {
        let context = assembler().assemble(0, 10_000).await.unwrap();
        assert!(context.is_empty());
        assert_eq!(context.text, "");
        assert_eq!(context.chapter_count, 0);
        assert_eq!(context.estimated_tokens, 0);
    }

    #[tokio::test]
    async fn earlier_contexts_are_prefixes_of_later_ones() {
        let assembler = assembler();
        let mut previous = String::new();
        for id in 1..=5 {
            let context = assembler.assemble(id, 10_000).await.unwrap();
            assert!(context.text.starts_with(&previous));
            previous = context.text;
        }
    }

    #[test]
    fn truncation_respects_budget_and_keeps_the_current_sentence() {
        let book = long_book();
        let counter = WhitespaceCounter;

        for up_to in [1, 7, 40, 41, 79, 120] {
            for budget in [1, 2, 3, 5, 6, 9, 17, 60, 250] {
                let context = build_context(&book, up_to, budget, &counter);
                assert!(
                    counter.count(&context.text) <= budget,
                    "up_to={up_to} budget={budget} text={:?}",
                    context.text
                );
                for future in (up_to + 1)..=120 {
                    assert!(!context.text.contains(&line(future)));
                }
                if budget >= 5 {
                    assert!(
                        context.text.contains(&line(up_to)),
                        "up_to={up_to} budget={budget} text={:?}",
                        context.text
                    );
                }
                assert_eq!(context.sentence_count, up_to as usize);
            }
        }
    }

    #[test]
    fn stats_describe_the_full_window() {
        let book = long_book();
        let context = build_context(&book, 90, 20, &WhitespaceCounter);

        assert!(context.truncated);
        assert_eq!(context.sentence_count, 90);
        assert_eq!(context.chapter_count, 3);
        assert!(context.estimated_tokens > 20);
        assert!(context.transmitted_tokens <= 20);
    }

    #[test]
    fn zero_budget_disables_truncation() {
        let book = long_book();
        let context = build_context(&book, 10, 0, &WhitespaceCounter);
        assert!(!context.truncated);
        assert!(context.text.contains(&line(1)));
    }

    #[test]
    fn truncation_prefers_a_nearby_chapter_marker() {
        let aligned = align_to_boundary(
            "sentence. Line 40 ends here.\n\n--- Chapter 2 ---\nLine 41.",
            "Line 41.",
        );
        assert_eq!(aligned, "--- Chapter 2 ---\nLine 41.");
    }

    #[test]
    fn truncation_skips_to_the_next_sentence() {
        let aligned = align_to_boundary("ends here. Line 9 ends here.", "Line 9 ends here.");
        assert_eq!(aligned, "Line 9 ends here.");
    }

    #[test]
    fn truncation_marks_mid_sentence_starts() {
        let long_tail = format!("{} and then it ended.", "word ".repeat(40));
        let aligned = align_to_boundary(&long_tail, "");
        assert!(aligned.starts_with("... word"));

        let far_marker = format!("{}. --- Chapter 9 ---", "x".repeat(250));
        assert!(align_to_boundary(&far_marker, "").starts_with("... "));
    }

    #[test]
    fn truncation_is_token_exact_with_bpe() {
        let counter = TiktokenCounter::new().expect("encoding loads");
        let text = "Start. ".repeat(100) + "End.";

        let cut = truncate_to_budget(&text, 10, &counter, "End.");
        assert!(counter.count(&cut) <= 10);
        assert!(cut.contains("End."));
    }

    #[test]
    fn abbreviations_in_the_latest_sentence_are_not_boundaries() {
        let book = vec![
            sentence(1, 1, 0, "Alpha beta gamma.", None),
            sentence(2, 1, 1, "Mr. Darcy bowed low.", None),
        ];

        for budget in [4, 5, 6, 8] {
            let context = build_context(&book, 2, budget, &WhitespaceCounter);
            assert_eq!(context.text, "Mr. Darcy bowed low.", "budget={budget}");
            assert!(context.truncated);
        }

        let aligned = align_to_boundary("low. Dr. Watson nodded.", "Dr. Watson nodded.");
        assert_eq!(aligned, "Dr. Watson nodded.");
        let aligned = align_to_boundary("Watson nodded.", "Dr. Watson nodded.");
        assert_eq!(aligned, "... Watson nodded.");
    }

    #[test]
    fn heard_so_far_counts_finished_sentences() {
        let (_, sentences) = two_chapters();
        let chapter_one: Vec<Sentence> =
            sentences.into_iter().filter(|s| s.chapter_id == 1).collect();

        let heard = heard_so_far(&chapter_one, 4.5, 100);
        assert_eq!(heard.text, "First sentence. Second sentence.");
        assert_eq!(heard.word_count, 4);
        assert_eq!(heard.current.map(|s| s.sentence_id), Some(3));

        let clipped = heard_so_far(&chapter_one, 6.0, 3);
        assert_eq!(clipped.text, "...sentence. Third sentence.");
        assert_eq!(clipped.word_count, 3);
    }

    #[test]
    fn heard_so_far_has_no_current_sentence_in_a_gap() {
        let sentences = vec![
            sentence(1, 1, 0, "Before.", Some((0.0, 1.0))),
            sentence(2, 1, 1, "After.", Some((2.0, 3.0))),
        ];
        let heard = heard_so_far(&sentences, 1.5, 10);
        assert!(heard.current.is_none());
        assert_eq!(heard.text, "Before.");

        let unaligned = vec![sentence(1, 1, 0, "Quiet.", None)];
        assert_eq!(heard_so_far(&unaligned, 9.0, 10).word_count, 0);
    }

    #[test]
    fn preview_cuts_on_char_boundaries() {
        assert_eq!(preview_text("abcdef", 3), "abc...");
        assert_eq!(preview_text("λόγος", 10), "λόγος");
        assert_eq!(preview_text("λόγος", 2), "λό...");
    }
}
