//! Maps a playback position `(chapter_id, audio_time)` to the sentence being narrated.
//!
//! Rules, first match wins:
//!
//! 1. an aligned sentence whose interval contains the time; when adjacent
//!    sentences share a boundary instant the one starting there wins
//!    (greatest `start_time`, then greatest `sequence`);
//! 2. the aligned sentence with the greatest `start_time` not after the time,
//!    which covers pauses between sentences and times past the last one;
//! 3. the chapter's first sentence by `sequence`.
//!
//! Any non-empty chapter therefore resolves for every input time, including
//! negative, non-finite, or unaligned cases.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{BardError, BardResult};
use crate::models::{ResolutionRule, ResolvedPosition, Sentence};
use crate::store::SentenceStore;

#[derive(Clone)]
pub struct PositionResolver {
    store: Arc<dyn SentenceStore>,
}

impl PositionResolver {
    pub fn new(store: Arc<dyn SentenceStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, chapter_id: i64, audio_time: f64) -> BardResult<ResolvedPosition> {
        let sentences = self.store.chapter_sentences(chapter_id).await?;

        let Some((sentence, rule)) = locate(&sentences, audio_time) else {
            return Err(if self.store.chapter(chapter_id).await?.is_some() {
                BardError::EmptyChapter(chapter_id)
            } else {
                BardError::ChapterNotFound(chapter_id)
            });
        };

        tracing::debug!(
            chapter_id,
            audio_time,
            sentence_id = sentence.sentence_id,
            ?rule,
            "resolved playback position"
        );

        Ok(ResolvedPosition {
            sentence_id: sentence.sentence_id,
            sentence: sentence.clone(),
            audio_time,
            rule,
        })
    }
}

/// Applies the resolution rules to one chapter's sentences (any order).
/// Returns `None` only when `sentences` is empty.
pub fn locate(sentences: &[Sentence], audio_time: f64) -> Option<(&Sentence, ResolutionRule)> {
    let containing = sentences
        .iter()
        .filter(|s| {
            s.interval()
                .is_some_and(|(start, end)| start <= audio_time && audio_time <= end)
        })
        .max_by(|a, b| later_start(a, b));
    if let Some(sentence) = containing {
        return Some((sentence, ResolutionRule::Containment));
    }

    let preceding = sentences
        .iter()
        .filter(|s| s.start_time.is_some_and(|start| start <= audio_time) && s.is_aligned())
        .max_by(|a, b| later_start(a, b));
    if let Some(sentence) = preceding {
        return Some((sentence, ResolutionRule::PrecedingStart));
    }

    sentences
        .iter()
        .min_by_key(|s| s.sequence)
        .map(|s| (s, ResolutionRule::ChapterStart))
}

fn later_start(a: &Sentence, b: &Sentence) -> Ordering {
    let a_start = a.start_time.unwrap_or(f64::NEG_INFINITY);
    let b_start = b.start_time.unwrap_or(f64::NEG_INFINITY);
    a_start
        .total_cmp(&b_start)
        .then_with(|| a.sequence.cmp(&b.sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{chapter, sentence, two_chapters};
    use crate::store::MemoryStore;

    fn resolver() -> PositionResolver {
        let (mut chapters, sentences) = two_chapters();
        chapters.push(chapter(3));
        let store = MemoryStore::new(chapters, sentences).expect("valid fixture");
        PositionResolver::new(Arc::new(store))
    }

    #[tokio::test]
    async fn time_inside_a_sentence_resolves_to_it() {
        let resolver = resolver();

        let position = resolver.resolve(1, 1.0).await.unwrap();
        assert_eq!(position.sentence_id, 1);
        assert_eq!(position.sentence.text, "First sentence.");
        assert_eq!(position.rule, ResolutionRule::Containment);

        assert_eq!(resolver.resolve(1, 3.0).await.unwrap().sentence_id, 2);
        assert_eq!(resolver.resolve(2, 1.5).await.unwrap().sentence_id, 4);
    }

    #[tokio::test]
    async fn shared_boundary_belongs_to_the_sentence_starting_there() {
        let resolver = resolver();
        assert_eq!(resolver.resolve(1, 2.0).await.unwrap().sentence_id, 2);
        assert_eq!(resolver.resolve(1, 4.0).await.unwrap().sentence_id, 3);
        assert_eq!(resolver.resolve(1, 0.0).await.unwrap().sentence_id, 1);
    }

    #[tokio::test]
    async fn missing_and_empty_chapters_fail() {
        let resolver = resolver();

        let err = resolver.resolve(999, 1.0).await.unwrap_err();
        assert!(matches!(err, BardError::ChapterNotFound(999)));

        let err = resolver.resolve(3, 1.0).await.unwrap_err();
        assert!(matches!(err, BardError::EmptyChapter(3)));
        assert!(err.is_resolution());
    }

    #[tokio::test]
    async fn resolution_is_total_for_non_empty_chapters() {
        let resolver = resolver();
        for time in [-50.0, -0.1, 0.0, 2.0, 5.99, 6.0, 1e9, f64::INFINITY, f64::NAN] {
            let position = resolver.resolve(1, time).await.unwrap();
            assert_eq!(position.sentence.chapter_id, 1);
        }
        assert_eq!(resolver.resolve(1, 1e9).await.unwrap().sentence_id, 3);
        assert_eq!(resolver.resolve(1, -5.0).await.unwrap().sentence_id, 1);
    }

    #[test]
    fn gap_between_sentences_resolves_to_the_previous_one() {
        let sentences = vec![
            sentence(10, 4, 0, "Before the pause.", Some((0.0, 2.0))),
            sentence(11, 4, 1, "After the pause.", Some((2.8, 5.0))),
        ];
        let (found, rule) = locate(&sentences, 2.4).unwrap();
        assert_eq!(found.sentence_id, 10);
        assert_eq!(rule, ResolutionRule::PrecedingStart);
    }

    #[test]
    fn time_before_first_alignment_falls_back_to_first_sentence() {
        let sentences = vec![
            sentence(21, 5, 1, "Second.", Some((7.0, 9.0))),
            sentence(20, 5, 0, "First.", Some((5.0, 7.0))),
        ];
        let (found, rule) = locate(&sentences, 0.0).unwrap();
        assert_eq!(found.sentence_id, 20);
        assert_eq!(rule, ResolutionRule::ChapterStart);
    }

    #[test]
    fn unaligned_chapter_falls_back_to_first_sentence() {
        let sentences = vec![
            sentence(31, 6, 1, "Later.", None),
            sentence(30, 6, 0, "Opening.", None),
        ];
        let (found, rule) = locate(&sentences, 42.0).unwrap();
        assert_eq!(found.sentence_id, 30);
        assert_eq!(rule, ResolutionRule::ChapterStart);
        assert!(locate(&[], 1.0).is_none());
    }

    #[test]
    fn zero_length_sentences_at_a_shared_instant_prefer_the_later_sequence() {
        let sentences = vec![
            sentence(40, 7, 0, "A.", Some((1.0, 1.0))),
            sentence(41, 7, 1, "B.", Some((1.0, 3.0))),
        ];
        assert_eq!(locate(&sentences, 1.0).unwrap().0.sentence_id, 41);
    }
}
